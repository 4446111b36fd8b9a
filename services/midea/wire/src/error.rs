//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message shorter than the minimum envelope size
    #[error("message too short: {0} bytes")]
    Length(usize),

    /// Envelope checksum, flag or length byte mismatch
    #[error("message checksum mismatch")]
    Checksum,

    /// Unknown message type
    #[error("unknown message type {0:#04x}")]
    MessageType(u8),

    /// Bad magic, fixed byte or size in an 8370 frame
    #[error("malformed frame")]
    MalformedFrame,

    /// Handshake response unusable
    #[error("authentication failed")]
    AuthenticationFailed,

    /// SHA-256 signature did not match the decrypted data
    #[error("signature mismatch")]
    SignatureMismatch,

    /// Encrypted frame requested before a handshake completed
    #[error("session key not established")]
    MissingSessionKey,

    /// AES key of an unsupported size
    #[error("invalid key length {0}")]
    KeyLength(usize),

    /// Cipher input not a multiple of the AES block size
    #[error("data not block aligned: {0} bytes")]
    BlockAlignment(usize),
}
