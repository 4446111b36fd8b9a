//! 5A5A application packets.
//!
//! Envelopes travel inside a 40-byte packet header, encrypted with the library
//! key and followed by a 16-byte MD5 signature:
//!
//! ```text
//! +-------+-------+-----------+-------+--------+-----------+------------+---------+
//! | 5A 5A | 01 11 | u16 len LE| 20 00 | msg id | time (8B) | device id  | 12 x 00 |
//! |       |       |           |       | (4B)   |           | (8B, LE)   |         |
//! +-------+-------+-----------+-------+--------+-----------+------------+---------+
//! | AES-ECB(envelope)                                                             |
//! +-------------------------------------------------------------------------------+
//! | MD5(packet ∥ salt) (16B)                                                      |
//! +-------------------------------------------------------------------------------+
//! ```

use crate::crypto::{ecb_decrypt, ecb_encrypt, packet_signature, BLOCK_SIZE};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 40;

/// Trailing MD5 signature size
pub const PACKET_SIGNATURE_SIZE: usize = 16;

/// Smallest packet that can carry an encrypted envelope
pub const MIN_PAYLOAD_PACKET_SIZE: usize = PACKET_HEADER_SIZE + PACKET_SIGNATURE_SIZE;

/// Packets shorter than this cannot carry a length field
const MIN_PACKET_SIZE: usize = 6;

/// Payload types of heartbeat acknowledgements
const HEARTBEAT_PAYLOAD_TYPES: [u16; 2] = [0x1001, 0x0001];

/// Encode a wall-clock time as eight two-digit fields, least significant first
/// (centiseconds, seconds, minutes, hours, day, month, year % 100, year / 100)
pub fn packet_time<Tz: TimeZone>(now: &DateTime<Tz>) -> [u8; 8] {
    let centis = (now.nanosecond() / 10_000_000) % 100;
    let year = now.year().rem_euclid(10_000) as u32;

    [
        centis as u8,
        now.second() as u8,
        now.minute() as u8,
        now.hour() as u8,
        now.day() as u8,
        now.month() as u8,
        (year % 100) as u8,
        (year / 100) as u8,
    ]
}

/// Builder for outgoing 5A5A packets
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    device_id: u64,
    timestamp: [u8; 8],
}

impl PacketBuilder {
    /// Builder stamped with the current local time
    pub fn new(device_id: u64) -> Self {
        Self {
            device_id,
            timestamp: packet_time(&Local::now()),
        }
    }

    /// Override the timestamp field
    pub fn with_timestamp(mut self, timestamp: [u8; 8]) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Packet carrying a serialized envelope
    pub fn command(&self, envelope: &[u8]) -> Bytes {
        let mut packet = self.header();
        packet.put_slice(&ecb_encrypt(envelope));
        Self::finalize(packet)
    }

    /// Heartbeat packet (no payload)
    pub fn heartbeat(&self) -> Bytes {
        let mut packet = self.header();
        packet[3] = 0x10;
        packet[6] = 0x7B;
        Self::finalize(packet)
    }

    fn header(&self) -> BytesMut {
        let mut packet = BytesMut::with_capacity(PACKET_HEADER_SIZE + 64);
        packet.put_slice(&[0x5A, 0x5A, 0x01, 0x11, 0x00, 0x00, 0x20, 0x00]);
        packet.put_u32(0);
        packet.put_slice(&self.timestamp);
        packet.put_u64_le(self.device_id);
        packet.put_bytes(0, 12);
        packet
    }

    fn finalize(mut packet: BytesMut) -> Bytes {
        let len = (packet.len() + PACKET_SIGNATURE_SIZE) as u16;
        packet[4..6].copy_from_slice(&len.to_le_bytes());
        let signature = packet_signature(&packet);
        packet.put_slice(&signature);
        packet.freeze()
    }
}

/// Length a packet claims for itself (bytes 4-5, little endian)
pub fn alleged_length(packet: &[u8]) -> Option<usize> {
    if packet.len() < MIN_PACKET_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([packet[4], packet[5]]) as usize)
}

/// Split a V2 byte stream into complete packets.
///
/// Returns the packets in order and the bytes of a trailing partial packet.
pub fn split_v2_packets(buf: &[u8]) -> Result<(Vec<Bytes>, Bytes), WireError> {
    let mut packets = Vec::new();
    let mut rest = buf;

    while let Some(alleged) = alleged_length(rest) {
        if alleged == 0 {
            return Err(WireError::MalformedFrame);
        }
        if rest.len() < alleged {
            break;
        }

        let (packet, tail) = rest.split_at(alleged);
        packets.push(Bytes::copy_from_slice(packet));
        rest = tail;
    }

    Ok((packets, Bytes::copy_from_slice(rest)))
}

/// What an inbound packet carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketContent {
    /// Heartbeat acknowledgement, nothing to do
    Heartbeat,
    /// Decrypted envelope (empty if decryption failed)
    Envelope(Vec<u8>),
    /// Encrypted part does not match the alleged length
    IllegalPayload {
        /// Payload type (bytes 2-3)
        payload_type: u16,
        /// Alleged packet length
        alleged: usize,
        /// Size of the encrypted part
        actual: usize,
    },
    /// Packet too short to carry anything
    IllegalMessage {
        /// Packet length
        len: usize,
    },
}

/// Classify an inbound packet and decrypt its envelope
pub fn open_packet(packet: &[u8]) -> PacketContent {
    let alleged = match alleged_length(packet) {
        Some(alleged) => alleged,
        None => return PacketContent::IllegalMessage { len: packet.len() },
    };

    let payload_type = u16::from_le_bytes([packet[2], packet[3]]);
    if HEARTBEAT_PAYLOAD_TYPES.contains(&payload_type) {
        return PacketContent::Heartbeat;
    }

    if packet.len() <= MIN_PAYLOAD_PACKET_SIZE {
        return PacketContent::IllegalMessage { len: packet.len() };
    }

    let encrypted = &packet[PACKET_HEADER_SIZE..packet.len() - PACKET_SIGNATURE_SIZE];
    match alleged.checked_sub(MIN_PAYLOAD_PACKET_SIZE) {
        Some(payload_len) if payload_len % BLOCK_SIZE == 0 => {
            PacketContent::Envelope(ecb_decrypt(encrypted))
        }
        _ => PacketContent::IllegalPayload {
            payload_type,
            alleged,
            actual: encrypted.len(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRequest;
    use crate::MessageType;
    use chrono::{FixedOffset, NaiveDate};

    const DEVICE_ID: u64 = 151_732_605_161_920;

    #[test]
    fn test_packet_time_layout() {
        let time = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(14, 5, 59, 123_456)
            .unwrap()
            .and_local_timezone(FixedOffset::east_opt(0).unwrap())
            .unwrap();

        assert_eq!(packet_time(&time), [12, 59, 5, 14, 9, 3, 24, 20]);
    }

    #[test]
    fn test_command_packet_layout() {
        let envelope =
            MessageRequest::new(0xA1, 0, MessageType::Query, vec![0x41, 0x81, 0x00, 0xFF])
                .serialize()
                .unwrap();
        let packet = PacketBuilder::new(DEVICE_ID)
            .with_timestamp([1, 2, 3, 4, 5, 6, 7, 8])
            .command(&envelope);

        // 40 header + 16 encrypted + 16 signature
        assert_eq!(packet.len(), 72);
        assert_eq!(&packet[..4], &[0x5A, 0x5A, 0x01, 0x11]);
        assert_eq!(alleged_length(&packet), Some(72));
        assert_eq!(&packet[6..8], &[0x20, 0x00]);
        assert_eq!(&packet[12..20], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packet[20..28], &DEVICE_ID.to_le_bytes());
        assert_eq!(&packet[56..], &packet_signature(&packet[..56]));

        assert_eq!(open_packet(&packet), PacketContent::Envelope(envelope.to_vec()));
    }

    #[test]
    fn test_heartbeat_packet() {
        let packet = PacketBuilder::new(DEVICE_ID).heartbeat();

        assert_eq!(packet.len(), 56);
        assert_eq!(&packet[..8], &[0x5A, 0x5A, 0x01, 0x10, 56, 0x00, 0x7B, 0x00]);
        assert_eq!(&packet[40..], &packet_signature(&packet[..40]));
    }

    #[test]
    fn test_open_heartbeat_and_illegal() {
        let mut ack = vec![0u8; 56];
        ack[..6].copy_from_slice(&[0x5A, 0x5A, 0x01, 0x10, 56, 0]);
        assert_eq!(open_packet(&ack), PacketContent::Heartbeat);

        assert_eq!(open_packet(&[0x5A, 0x5A]), PacketContent::IllegalMessage { len: 2 });

        let mut short = vec![0u8; 56];
        short[..6].copy_from_slice(&[0x5A, 0x5A, 0x01, 0x11, 56, 0]);
        assert_eq!(open_packet(&short), PacketContent::IllegalMessage { len: 56 });

        let mut odd = vec![0u8; 70];
        odd[..6].copy_from_slice(&[0x5A, 0x5A, 0x01, 0x11, 70, 0]);
        assert_eq!(
            open_packet(&odd),
            PacketContent::IllegalPayload {
                payload_type: 0x1101,
                alleged: 70,
                actual: 14
            }
        );
    }

    #[test]
    fn test_split_v2_packets() {
        let mut stream = vec![0x01u8; 5];
        stream.push(0x00);
        stream.extend_from_slice(&[0x01; 7]);

        let (packets, rest) = split_v2_packets(&stream).unwrap();
        assert_eq!(packets, vec![Bytes::from_static(&[0x01])]);

        let mut expected = vec![0x01u8; 4];
        expected.push(0x00);
        expected.extend_from_slice(&[0x01; 7]);
        assert_eq!(&rest[..], &expected[..]);
    }

    #[test]
    fn test_split_v2_packets_segmented() {
        let builder = PacketBuilder::new(DEVICE_ID);
        let first = builder.heartbeat();
        let second = builder.command(&[0xAA; 20]);

        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let (packets, rest) = split_v2_packets(&stream[..70]).unwrap();
        assert_eq!(packets, vec![first.clone()]);
        assert_eq!(&rest[..], &stream[56..70]);

        let mut next = rest.to_vec();
        next.extend_from_slice(&stream[70..]);
        let (packets, rest) = split_v2_packets(&next).unwrap();
        assert_eq!(packets, vec![second]);
        assert!(rest.is_empty());

        assert_eq!(
            split_v2_packets(&[0x5A, 0x5A, 0x01, 0x11, 0x00, 0x00, 0x00]),
            Err(WireError::MalformedFrame)
        );
    }
}
