//! Envelope serialization and parsing.
//!
//! A serialized envelope is `header (10B) | body | checksum (1B)`. The checksum
//! covers everything after the flag byte.

use crate::checksum::checksum;
use crate::header::{Header, MessageType, ENVELOPE_FLAG, HEADER_LENGTH};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Body length of the appliance query
const QUERY_APPLIANCE_BODY_LENGTH: usize = 19;

/// Serialize `header` and `body`, recomputing the length byte and appending the checksum
pub fn serialize(header: &Header, body: &[u8]) -> Result<Bytes, WireError> {
    let header = Header::new(
        header.device_type,
        header.frame_protocol_version,
        header.device_protocol_version,
        header.message_type,
        body.len(),
    )?;

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len() + 1);
    header.encode(&mut buf);
    buf.put_slice(body);
    let sum = checksum(&buf[1..]);
    buf.put_u8(sum);

    Ok(buf.freeze())
}

/// Verify flag, length byte and checksum of a serialized envelope
pub fn verify(message: &[u8]) -> Result<(), WireError> {
    if message.len() < HEADER_LENGTH + 1 {
        return Err(WireError::Length(message.len()));
    }

    let (stream, sum) = message.split_at(message.len() - 1);
    if stream[0] != ENVELOPE_FLAG
        || stream[1] as usize != stream.len()
        || checksum(&stream[1..]) != sum[0]
    {
        return Err(WireError::Checksum);
    }

    Ok(())
}

/// Outgoing envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRequest {
    /// Device family code
    pub device_type: u8,
    /// Device protocol version learned from the appliance
    pub protocol_version: u8,
    /// Raw message type byte
    pub message_type: u8,
    /// Body, starting with the body type byte when there is one
    pub body: Bytes,
}

impl MessageRequest {
    /// Create a request with a typed message type
    pub fn new(
        device_type: u8,
        protocol_version: u8,
        message_type: MessageType,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            device_type,
            protocol_version,
            message_type: message_type.into(),
            body: body.into(),
        }
    }

    /// Create a request carrying a caller-supplied body and message type byte
    pub fn custom(
        device_type: u8,
        protocol_version: u8,
        cmd_type: u8,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            device_type,
            protocol_version,
            message_type: cmd_type,
            body: body.into(),
        }
    }

    /// Query the appliance description (protocol version 0, 19 zero bytes)
    pub fn query_appliance(device_type: u8) -> Self {
        Self::new(
            device_type,
            0,
            MessageType::QueryAppliance,
            vec![0u8; QUERY_APPLIANCE_BODY_LENGTH],
        )
    }

    /// Body type byte (first body byte)
    pub fn body_type(&self) -> Option<u8> {
        self.body.first().copied()
    }

    /// Header for this request
    pub fn header(&self) -> Result<Header, WireError> {
        Header::new(
            self.device_type,
            0,
            self.protocol_version,
            self.message_type,
            self.body.len(),
        )
    }

    /// Serialize to wire bytes
    pub fn serialize(&self) -> Result<Bytes, WireError> {
        serialize(&self.header()?, &self.body)
    }
}

/// Incoming envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    /// Decoded header
    pub header: Header,
    /// Body without the trailing checksum
    pub body: Bytes,
}

impl MessageResponse {
    /// Parse a decrypted envelope; anything shorter than 11 bytes is a length error
    pub fn parse(message: &[u8]) -> Result<Self, WireError> {
        if message.len() < HEADER_LENGTH + 1 {
            return Err(WireError::Length(message.len()));
        }

        let header = Header::decode(message)?;
        let body = Bytes::copy_from_slice(&message[HEADER_LENGTH..message.len() - 1]);

        Ok(Self { header, body })
    }

    /// Device family code
    pub fn device_type(&self) -> u8 {
        self.header.device_type
    }

    /// Device protocol version
    pub fn protocol_version(&self) -> u8 {
        self.header.device_protocol_version
    }

    /// Raw message type byte
    pub fn message_type(&self) -> u8 {
        self.header.message_type
    }

    /// Body type byte, if the body is not empty
    pub fn body_type(&self) -> Option<u8> {
        self.body.first().copied()
    }
}
