//! Session error types.

use midea_wire::WireError;
use thiserror::Error;

/// Errors raised while connecting to or talking with a device
#[derive(Error, Debug)]
pub enum SessionError {
    /// Framing, cipher or handshake failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation did not finish in time
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// No socket is open
    #[error("not connected")]
    NotConnected,

    /// Every query of the initial refresh failed
    #[error("refresh failed")]
    RefreshFailed,

    /// Token or key could not be decoded
    #[error("invalid credentials: {0}")]
    Credentials(String),

    /// Device codec could not build or parse a message
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SessionError {
    /// Whether the socket can no longer be used
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_)
                | SessionError::Timeout(_)
                | SessionError::ConnectionClosed
                | SessionError::NotConnected
        )
    }
}

/// Errors raised by device codecs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Envelope could not be parsed
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Body shorter than the fields the codec reads
    #[error("body too short: need {needed} bytes, got {actual}")]
    Truncated {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Attribute name not known to this device kind
    #[error("unknown attribute {0}")]
    UnknownAttribute(String),

    /// Value of the wrong type or outside the accepted set
    #[error("invalid value for {attribute}: {value}")]
    InvalidValue {
        /// Attribute name
        attribute: String,
        /// Offending value
        value: String,
    },
}
