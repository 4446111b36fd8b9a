//! UDP broadcast discovery of appliances on the local network.
//!
//! A fixed probe is broadcast to ports 6445 and 20086 on every private
//! network of the host (or sent to a single address). Appliances answer
//! with either an encrypted 5A5A packet (V2, or V3 inside an 8370 frame)
//! or an XML document (V1). Replies are collected until the socket stays
//! idle for the timeout.
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), midea_discovery::DiscoveryError> {
//! let devices = midea_discovery::discover(&[0xA1], None).await?;
//! for (id, device) in &devices {
//!     println!("{} at {}:{}", id, device.ip_address, device.port);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod network;
pub mod reply;
pub mod scanner;

// Re-export main types
pub use error::DiscoveryError;
pub use network::{broadcast_address, broadcast_addresses};
pub use reply::{device_id_from_info, model_from_sn, parse_reply, DiscoveredDevice, Reply};
pub use scanner::{
    discover, Discoverer, DiscoveryConfig, BROADCAST_MSG, DEVICE_INFO_MSG, DISCOVERY_PORTS,
};
