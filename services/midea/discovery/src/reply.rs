//! Decoding of discovery replies.
//!
//! V2 and V3 devices answer with a 5A5A packet (V3 wraps it in an 8370
//! frame) whose encrypted part carries the port, serial number and SSID.
//! V1 devices answer with an XML document and need a follow-up TCP query
//! for their id, see [`device_id_from_info`].

use crate::error::DiscoveryError;
use midea_wire::{ecb_decrypt, ProtocolVersion, FRAME_MAGIC};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Shortest 5A5A reply worth decoding
pub const MIN_REPLY_LENGTH: usize = 104;

const PACKET_MAGIC: [u8; 2] = [0x5A, 0x5A];
const XML_PREFIX: &[u8] = b"<?xml ";
const INFO_HEADER_SIZE: usize = 64;
const TRAILER_SIZE: usize = 16;

/// An appliance that answered the probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Appliance id
    pub device_id: u64,
    /// Family code
    #[serde(rename = "type")]
    pub device_type: u8,
    /// Source address of the reply
    pub ip_address: Ipv4Addr,
    /// TCP port of the appliance
    pub port: u16,
    /// Model string
    pub model: String,
    /// Serial number
    pub sn: String,
    /// LAN protocol generation
    pub protocol: ProtocolVersion,
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Complete V2/V3 answer
    Device(DiscoveredDevice),
    /// V1 answer; `device_id` is 0 until fetched over TCP
    Legacy(DiscoveredDevice),
}

/// Decode a datagram received from `ip`.
///
/// Returns `Ok(None)` for datagrams that are not discovery replies.
pub fn parse_reply(data: &[u8], ip: Ipv4Addr) -> Result<Option<Reply>, DiscoveryError> {
    if data.len() >= MIN_REPLY_LENGTH && (data[..2] == PACKET_MAGIC || data[8..10] == PACKET_MAGIC)
    {
        let (protocol, packet) = if data[..2] == PACKET_MAGIC {
            (ProtocolVersion::V2, data)
        } else if data[..2] == FRAME_MAGIC {
            (ProtocolVersion::V3, &data[8..data.len() - TRAILER_SIZE])
        } else {
            return Ok(None);
        };
        parse_packet(packet, ip, protocol).map(|device| Some(Reply::Device(device)))
    } else if data.starts_with(XML_PREFIX) {
        parse_xml_reply(data, ip).map(|device| Some(Reply::Legacy(device)))
    } else {
        Ok(None)
    }
}

fn parse_packet(
    packet: &[u8],
    ip: Ipv4Addr,
    protocol: ProtocolVersion,
) -> Result<DiscoveredDevice, DiscoveryError> {
    if packet.len() < 40 + TRAILER_SIZE {
        return Err(DiscoveryError::InvalidReply(format!(
            "packet too short: {} bytes",
            packet.len()
        )));
    }
    let device_id = le_u64(&packet[20..26]);

    let reply = ecb_decrypt(&packet[40..packet.len() - TRAILER_SIZE]);
    if reply.len() < 41 {
        return Err(DiscoveryError::InvalidReply(format!(
            "decrypted reply too short: {} bytes",
            reply.len()
        )));
    }
    let ssid_end = 41 + reply[40] as usize;
    let ssid = reply
        .get(41..ssid_end)
        .ok_or_else(|| DiscoveryError::InvalidReply("ssid truncated".into()))
        .and_then(|ssid| utf8(ssid, "ssid"))?;
    let device_type = ssid
        .split('_')
        .nth(1)
        .and_then(|code| u8::from_str_radix(code, 16).ok())
        .ok_or_else(|| DiscoveryError::InvalidReply(format!("no family code in ssid {}", ssid)))?;

    let port = u16::try_from(le_u64(&reply[4..8]))
        .map_err(|_| DiscoveryError::InvalidReply("port out of range".into()))?;

    Ok(DiscoveredDevice {
        device_id,
        device_type,
        ip_address: ip,
        port,
        model: utf8(&reply[17..25], "model")?,
        sn: utf8(&reply[8..40], "sn")?,
        protocol,
    })
}

fn parse_xml_reply(data: &[u8], ip: Ipv4Addr) -> Result<DiscoveredDevice, DiscoveryError> {
    let text = String::from_utf8_lossy(data);
    let attrs = find_element(&text, &["body", "device"])?
        .ok_or(DiscoveryError::MissingElement("body/device"))?;

    let field = |name: &'static str| {
        attrs
            .get(name)
            .map(String::as_str)
            .ok_or(DiscoveryError::MissingAttribute(name))
    };
    let port = field("port")?
        .parse::<u16>()
        .map_err(|e| DiscoveryError::InvalidReply(format!("port: {}", e)))?;
    let device_type = field("apc_type")?
        .parse::<u8>()
        .map_err(|e| DiscoveryError::InvalidReply(format!("apc_type: {}", e)))?;
    let sn = field("apc_sn")?.to_string();

    Ok(DiscoveredDevice {
        device_id: 0,
        device_type,
        ip_address: ip,
        port,
        model: model_from_sn(&sn),
        sn,
        protocol: ProtocolVersion::V1,
    })
}

/// Model embedded in a V1 serial number
pub fn model_from_sn(sn: &str) -> String {
    let model = match sn.len() {
        32 => sn.get(9..17),
        22 => sn.get(3..11),
        _ => None,
    };
    model.unwrap_or_default().to_string()
}

/// Appliance id from a device-info response.
///
/// Responses without an XML document yield 0.
pub fn device_id_from_info(response: &[u8]) -> Result<u64, DiscoveryError> {
    if response.len() < INFO_HEADER_SIZE + TRAILER_SIZE {
        return Ok(0);
    }
    let xml = &response[INFO_HEADER_SIZE..response.len() - TRAILER_SIZE];
    if !xml.starts_with(XML_PREFIX) {
        return Ok(0);
    }

    let text = String::from_utf8_lossy(xml);
    let attrs = find_element(&text, &["smartDevice"])?
        .ok_or(DiscoveryError::MissingElement("smartDevice"))?;
    let dev_id = attrs
        .get("devId")
        .ok_or(DiscoveryError::MissingAttribute("devId"))?;
    let bytes =
        hex::decode(dev_id).map_err(|e| DiscoveryError::InvalidReply(format!("devId: {}", e)))?;
    if bytes.len() > 8 {
        return Err(DiscoveryError::InvalidReply(format!("devId too long: {}", dev_id)));
    }
    Ok(le_u64(&bytes))
}

/// Attributes of the first element at `path` below the document root
fn find_element(
    xml: &str,
    path: &[&str],
) -> Result<Option<HashMap<String, String>>, DiscoveryError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if matches_path(&stack, &e, path) {
                    return collect_attributes(&e).map(Some);
                }
                stack.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Empty(e)) => {
                if matches_path(&stack, &e, path) {
                    return collect_attributes(&e).map(Some);
                }
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(DiscoveryError::Xml(e.to_string())),
        }
    }
}

fn matches_path(stack: &[String], element: &BytesStart<'_>, path: &[&str]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    // stack[0] is the root element
    stack.len() == path.len()
        && stack[1..].iter().map(String::as_str).eq(parents.iter().copied())
        && element.name().as_ref() == last.as_bytes()
}

fn collect_attributes(element: &BytesStart<'_>) -> Result<HashMap<String, String>, DiscoveryError> {
    let mut attrs = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| DiscoveryError::Xml(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| DiscoveryError::Xml(e.to_string()))?;
        attrs.insert(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        );
    }
    Ok(attrs)
}

fn le_u64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn utf8(bytes: &[u8], field: &str) -> Result<String, DiscoveryError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| DiscoveryError::InvalidReply(format!("{} is not utf-8", field)))
}
