//! Discovery error types.

use thiserror::Error;

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply body is not well-formed XML
    #[error("xml error: {0}")]
    Xml(String),

    /// Expected XML element not present
    #[error("missing element {0}")]
    MissingElement(&'static str),

    /// Expected XML attribute not present
    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),

    /// Reply fields out of range or undecodable
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}
