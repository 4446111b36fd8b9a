//! Message envelopes, application packets and 8370 transport security.
//!
//! This crate provides the byte-level protocol spoken by the appliances on the
//! local network, from the innermost envelope to the outer 8370 frame.
//!
//! ## Layers
//!
//! - **Envelope**: 10-byte header, body, additive checksum
//! - **New protocol records**: tag/length/value records inside some bodies
//! - **5A5A packet**: envelope encrypted with the library key, MD5 signed
//! - **8370 frame** (V3 only): sequenced, AES-CBC encrypted, SHA-256 signed
//!
//! ## Wire Format
//!
//! ```text
//! V1/V2:  | 5A5A packet(AES-ECB(envelope)) |
//! V3:     | 8370 header | AES-CBC(seq ∥ 5A5A packet ∥ padding) | SHA-256 |
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod header;
pub mod message;
pub mod new_protocol;
pub mod packet;

// Re-export main types
pub use checksum::{checksum, crc8};
pub use crypto::{
    cbc_decrypt, cbc_encrypt, ecb_decrypt, ecb_encrypt, packet_signature, sha256, udp_id,
    UdpIdMethod, BLOCK_SIZE,
};
pub use error::WireError;
pub use frame::{
    frame_length, FrameCodec, FrameType, ERROR_SENTINEL, FRAME_HEADER_SIZE, FRAME_MAGIC,
    HANDSHAKE_RESPONSE_SIZE, SIGNATURE_SIZE,
};
pub use header::{
    build_header, Header, MessageType, ProtocolVersion, ENVELOPE_FLAG, HEADER_LENGTH,
    MAX_BODY_LENGTH,
};
pub use message::{serialize, verify, MessageRequest, MessageResponse};
pub use new_protocol::{pack_record, pack_records, parse_records, RecordWidth, NARROW_BODY_TYPE};
pub use packet::{
    alleged_length, open_packet, packet_time, split_v2_packets, PacketBuilder, PacketContent,
    MIN_PAYLOAD_PACKET_SIZE, PACKET_HEADER_SIZE, PACKET_SIGNATURE_SIZE,
};
