//! Envelope header processing.
//!
//! Every appliance message starts with a fixed 10-byte header:
//!
//! ```text
//! +------+--------+-------------+-----------+----------+----------+-----------+------------+----------+
//! | 0xAA | length | device type | reserved  | reserved | frame id | frame ver | device ver | msg type |
//! | 1B   | 1B     | 1B          | 1B (0x00) | 2B       | 1B       | 1B        | 1B         | 1B       |
//! +------+--------+-------------+-----------+----------+----------+-----------+------------+----------+
//! ```

use crate::WireError;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Envelope header size in bytes
pub const HEADER_LENGTH: usize = 10;

/// First byte of every envelope
pub const ENVELOPE_FLAG: u8 = 0xAA;

/// Largest body that still fits the one-byte length field (checksum excluded)
pub const MAX_BODY_LENGTH: usize = u8::MAX as usize - HEADER_LENGTH;

/// Message types carried in the last header byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Change device state
    Set = 0x02,
    /// Request device state
    Query = 0x03,
    /// Unsolicited status report
    Notify1 = 0x04,
    /// Unsolicited status report (second form)
    Notify2 = 0x05,
    /// Device-side exception
    Exception = 0x06,
    /// Device-side exception (second form)
    Exception2 = 0x0A,
    /// Query the appliance description, used to learn the device protocol version
    QueryAppliance = 0xA0,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(MessageType::Set),
            0x03 => Ok(MessageType::Query),
            0x04 => Ok(MessageType::Notify1),
            0x05 => Ok(MessageType::Notify2),
            0x06 => Ok(MessageType::Exception),
            0x0A => Ok(MessageType::Exception2),
            0xA0 => Ok(MessageType::QueryAppliance),
            _ => Err(WireError::MessageType(value)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// LAN protocol generation spoken by a device
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// XML discovery, plain packets
    V1 = 1,
    /// 5A5A packets
    V2 = 2,
    /// 5A5A packets inside 8370 frames
    V3 = 3,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            _ => Err(format!("unknown protocol version {}", value)),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(value: ProtocolVersion) -> Self {
        value as u8
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", *self as u8)
    }
}

/// Decoded envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total length byte (header + body)
    pub length: u8,
    /// Device family code (0xA1, 0xAC, ...)
    pub device_type: u8,
    /// Frame id
    pub frame_id: u8,
    /// Frame protocol version
    pub frame_protocol_version: u8,
    /// Device protocol version
    pub device_protocol_version: u8,
    /// Raw message type byte
    pub message_type: u8,
}

impl Header {
    /// Build a header for a body of `body_length` bytes
    pub fn new(
        device_type: u8,
        frame_protocol_version: u8,
        device_protocol_version: u8,
        message_type: u8,
        body_length: usize,
    ) -> Result<Self, WireError> {
        if body_length > MAX_BODY_LENGTH {
            return Err(WireError::Length(body_length));
        }

        Ok(Self {
            length: (HEADER_LENGTH + body_length) as u8,
            device_type,
            frame_id: 0,
            frame_protocol_version,
            device_protocol_version,
            message_type,
        })
    }

    /// Encode the header (always 10 bytes)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(ENVELOPE_FLAG);
        buf.put_u8(self.length);
        buf.put_u8(self.device_type);
        buf.put_u8(0x00);
        buf.put_u16(0);
        buf.put_u8(self.frame_id);
        buf.put_u8(self.frame_protocol_version);
        buf.put_u8(self.device_protocol_version);
        buf.put_u8(self.message_type);
    }

    /// Decode a header from the first 10 bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LENGTH {
            return Err(WireError::Length(buf.len()));
        }

        Ok(Self {
            length: buf[1],
            device_type: buf[2],
            frame_id: buf[6],
            frame_protocol_version: buf[7],
            device_protocol_version: buf[8],
            message_type: buf[9],
        })
    }

    /// Typed message type, if known
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }
}

/// Build the 10 header bytes for a body of `body_length` bytes
pub fn build_header(
    device_type: u8,
    frame_protocol_version: u8,
    device_protocol_version: u8,
    message_type: MessageType,
    body_length: usize,
) -> Result<[u8; HEADER_LENGTH], WireError> {
    let header = Header::new(
        device_type,
        frame_protocol_version,
        device_protocol_version,
        message_type.into(),
        body_length,
    )?;

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH);
    header.encode(&mut buf);

    let mut out = [0u8; HEADER_LENGTH];
    out.copy_from_slice(&buf);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::try_from(0x03).unwrap(), MessageType::Query);
        assert_eq!(
            MessageType::try_from(0xA0).unwrap(),
            MessageType::QueryAppliance
        );
        assert_eq!(MessageType::try_from(0x0A).unwrap(), MessageType::Exception2);
        assert!(MessageType::try_from(0x07).is_err());
    }

    #[test]
    fn test_protocol_version_conversion() {
        assert_eq!(ProtocolVersion::try_from(3).unwrap(), ProtocolVersion::V3);
        assert!(ProtocolVersion::try_from(4).is_err());
        assert_eq!(ProtocolVersion::V2.to_string(), "V2");
    }

    #[test]
    fn test_build_header_layout() {
        let header = build_header(0xA1, 0, 3, MessageType::Query, 21).unwrap();
        assert_eq!(
            header,
            [0xAA, 31, 0xA1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x03]
        );
    }

    #[test]
    fn test_header_encode_decode() {
        let header = Header::new(0xAC, 0, 2, MessageType::Set.into(), 5).unwrap();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), HEADER_LENGTH);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.message_type(), Some(MessageType::Set));
    }

    #[test]
    fn test_oversized_body_rejected() {
        assert!(Header::new(0xA1, 0, 0, 0x02, MAX_BODY_LENGTH).is_ok());
        assert_eq!(
            Header::new(0xA1, 0, 0, 0x02, MAX_BODY_LENGTH + 1),
            Err(WireError::Length(MAX_BODY_LENGTH + 1))
        );
    }
}
