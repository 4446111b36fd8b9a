//! Per-device TCP sessions for local-network appliances.
//!
//! This crate keeps one long-lived connection per appliance: it connects,
//! runs the V3 handshake when required, refreshes the status, sends
//! heartbeats and reconnects after failures. Replies are decoded by a
//! per-family [`DeviceKind`] codec and merged into an attribute map that
//! observers subscribe to.
//!
//! ## Features
//!
//! - **TCP Transport**: pluggable [`Connector`], plain TCP by default
//! - **Handshake**: token/key exchange deriving the 8370 session key
//! - **Keepalive**: heartbeat every 10 s, status refresh every 30 s
//! - **Auto-reconnect**: fixed 5 s delay between attempts
//! - **Observers**: synchronous callbacks with every set of changes
//!
//! ## Example
//!
//! ```rust,no_run
//! use midea_session::{DeviceInfo, DeviceKind, DeviceSession, SessionConfig};
//!
//! # async fn example(info: DeviceInfo, codec: Box<dyn DeviceKind>) {
//! let (session, handle) = DeviceSession::new(info, None, codec, SessionConfig::default());
//! handle.register_update(|changes| println!("{:?}", changes));
//!
//! let task = session.spawn();
//! handle.set_attribute("power", true).await.ok();
//!
//! handle.stop();
//! task.await.ok();
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attributes;
pub mod device;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod session;
pub mod transport;
pub mod unsupported;

// Re-export main types
pub use attributes::{AttributeMap, AttributeValue, Observer, SharedState, AVAILABLE};
pub use device::{Command, Credentials, DeviceInfo, DeviceKind, MessageSerial, SetAction};
pub use error::{CodecError, SessionError};
pub use handshake::{authenticate, recv_handshake_response, Handshake};
pub use keepalive::{build_heartbeat, KeepaliveSchedule};
pub use session::{
    DeviceSession, ParseResult, SessionCommand, SessionConfig, SessionHandle, SessionState,
};
pub use transport::{connect_tcp, Connector, DeviceStream, TcpConnector};
pub use unsupported::UnsupportedCommands;
