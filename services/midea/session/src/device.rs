//! Device identity, credentials and the per-kind codec boundary.

use crate::attributes::{AttributeMap, AttributeValue};
use crate::error::{CodecError, SessionError};
use midea_wire::{MessageRequest, MessageResponse, ProtocolVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Highest message serial before wrapping back to 1
const MAX_MESSAGE_SERIAL: u8 = 99;

/// Identity and endpoint of one appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Appliance id (48 bits used)
    pub device_id: u64,
    /// Family code, e.g. 0xA1 for dehumidifiers
    pub device_type: u8,
    /// LAN address
    pub ip: Ipv4Addr,
    /// LAN port, usually 6444
    pub port: u16,
    /// Transport protocol generation
    pub protocol: ProtocolVersion,
    /// Model string reported by discovery
    #[serde(default)]
    pub model: String,
    /// Model subtype
    #[serde(default)]
    pub subtype: u16,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// Token/key pair used by the V3 handshake
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Raw token sent in the handshake request
    pub token: Vec<u8>,
    /// Raw key used to derive the session key
    pub key: Vec<u8>,
}

impl Credentials {
    /// Decode the hex pair handed out by the cloud account
    pub fn from_hex(token: &str, key: &str) -> Result<Self, SessionError> {
        let token = hex::decode(token.trim())
            .map_err(|e| SessionError::Credentials(format!("token: {}", e)))?;
        let key =
            hex::decode(key.trim()).map_err(|e| SessionError::Credentials(format!("key: {}", e)))?;
        Ok(Self { token, key })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}

/// Per-session message serial, cycling through 1..=99
#[derive(Debug, Default)]
pub struct MessageSerial(AtomicU8);

impl MessageSerial {
    /// Counter whose first value will be 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the next serial
    pub fn next(&self) -> u8 {
        let advance = |v: u8| {
            if v >= MAX_MESSAGE_SERIAL {
                1
            } else {
                v + 1
            }
        };
        // fetch_update with an infallible closure never returns Err
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(advance(v)))
        {
            Ok(previous) | Err(previous) => advance(previous),
        }
    }
}

/// Outgoing request tagged with the class used for unsupported tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Name of the message class
    pub class: String,
    /// The request itself
    pub request: MessageRequest,
}

impl Command {
    /// Tag a request with its class
    pub fn new(class: impl Into<String>, request: MessageRequest) -> Self {
        Self {
            class: class.into(),
            request,
        }
    }
}

/// What a codec wants done for an attribute change
#[derive(Debug, Clone, PartialEq)]
pub enum SetAction {
    /// Send this request to the device
    Send(MessageRequest),
    /// Apply locally, nothing goes on the wire
    Local(AttributeMap),
}

/// Per-family codec: builds queries and set commands, parses replies
pub trait DeviceKind: Send {
    /// Family code this codec speaks for
    fn device_type(&self) -> u8;

    /// Attribute map before any reply arrived
    fn initial_attributes(&self) -> AttributeMap;

    /// Status queries sent on every refresh
    fn build_query(&self, protocol_version: u8) -> Vec<Command>;

    /// Queries sent once after the initial refresh, without waiting for replies
    fn capabilities_query(&self, _protocol_version: u8) -> Vec<Command> {
        Vec::new()
    }

    /// Apply a reply and return the attributes it changed
    fn process_message(&mut self, response: &MessageResponse) -> Result<AttributeMap, CodecError>;

    /// Translate an attribute change into a request or a local update
    fn set_attribute(
        &mut self,
        name: &str,
        value: &AttributeValue,
        protocol_version: u8,
    ) -> Result<SetAction, CodecError>;
}
