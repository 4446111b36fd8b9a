//! 8370 transport frames for protocol version 3.
//!
//! ```text
//! +------+------+---------------+------+--------------------------+
//! | 0x83 | 0x70 | u16 size (BE) | 0x20 | padding << 4 | frame type |
//! +------+------+---------------+------+--------------------------+
//! | u16 sequence (BE) | payload | random padding               |  AES-CBC for
//! +-------------------+---------+------------------------------+  encrypted types
//! | SHA-256(header ∥ sequence ∥ payload ∥ padding) (32B)       |  encrypted types only
//! +------------------------------------------------------------+
//! ```
//!
//! `size` counts payload, padding and signature; the header and the sequence
//! number add 8 more bytes on the wire.

use crate::crypto::{cbc_decrypt, cbc_encrypt, sha256, BLOCK_SIZE};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::{trace, warn};

/// Frame magic bytes
pub const FRAME_MAGIC: [u8; 2] = [0x83, 0x70];

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 6;

/// Signature size appended to encrypted frames
pub const SIGNATURE_SIZE: usize = 32;

/// Handshake response payload size (challenge + signature)
pub const HANDSHAKE_RESPONSE_SIZE: usize = 64;

/// Payload a device sends instead of a frame it cannot process
pub const ERROR_SENTINEL: &[u8] = b"ERROR";

const FRAME_FIXED_BYTE: u8 = 0x20;
const SEQUENCE_SIZE: usize = 2;

/// 8370 frame types (low nibble of the sixth header byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Token sent by the client
    HandshakeRequest = 0x0,
    /// Challenge returned by the device
    HandshakeResponse = 0x1,
    /// Encrypted frame sent by the device
    EncryptedResponse = 0x3,
    /// Encrypted frame sent by the client
    EncryptedRequest = 0x6,
}

impl FrameType {
    /// Whether frames of this type are encrypted and signed
    pub fn is_encrypted(self) -> bool {
        matches!(self, FrameType::EncryptedResponse | FrameType::EncryptedRequest)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FrameType::HandshakeRequest),
            0x1 => Ok(FrameType::HandshakeResponse),
            0x3 => Ok(FrameType::EncryptedResponse),
            0x6 => Ok(FrameType::EncryptedRequest),
            _ => Err(WireError::MalformedFrame),
        }
    }
}

/// Wire length of the frame starting at `buf[0]`, or `None` until the header is complete
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    if buf[..2] != FRAME_MAGIC {
        return Err(WireError::MalformedFrame);
    }
    let size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    Ok(Some(size + FRAME_HEADER_SIZE + SEQUENCE_SIZE))
}

/// Per-connection 8370 state: session key and sequence counters
#[derive(Debug, Default)]
pub struct FrameCodec {
    session_key: Option<Vec<u8>>,
    request_count: u16,
    response_count: u16,
}

impl FrameCodec {
    /// Create a codec without a session key
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the next outgoing frame
    pub fn request_count(&self) -> u16 {
        self.request_count
    }

    /// Sequence number carried by the last decoded frame
    pub fn response_count(&self) -> u16 {
        self.response_count
    }

    /// Session key, once the handshake completed
    pub fn session_key(&self) -> Option<&[u8]> {
        self.session_key.as_deref()
    }

    /// Wrap the provisioning token in a handshake request frame
    pub fn handshake_request(&mut self, token: &[u8]) -> Result<Bytes, WireError> {
        self.encode(token, FrameType::HandshakeRequest)
    }

    /// Derive the session key from the 64-byte handshake response.
    ///
    /// The first 32 bytes are decrypted with `key` (AES-CBC, zero IV) and must
    /// hash to the last 32 bytes. The session key is the plaintext XOR `key`.
    /// Both sequence counters restart at zero.
    pub fn derive_session_key(
        &mut self,
        response: &[u8],
        key: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        if response == ERROR_SENTINEL || response.len() != HANDSHAKE_RESPONSE_SIZE {
            return Err(WireError::AuthenticationFailed);
        }

        let (challenge, signature) = response.split_at(HANDSHAKE_RESPONSE_SIZE / 2);
        let plain = cbc_decrypt(key, challenge)?;
        if sha256(&plain)[..] != *signature {
            return Err(WireError::SignatureMismatch);
        }

        let session_key: Vec<u8> = plain.iter().zip(key).map(|(p, k)| p ^ k).collect();
        self.session_key = Some(session_key.clone());
        self.request_count = 0;
        self.response_count = 0;
        Ok(session_key)
    }

    /// Encode one frame, padding with random bytes for encrypted types
    pub fn encode(&mut self, payload: &[u8], frame_type: FrameType) -> Result<Bytes, WireError> {
        self.encode_with_rng(payload, frame_type, &mut rand::thread_rng())
    }

    fn encode_with_rng<R: RngCore>(
        &mut self,
        payload: &[u8],
        frame_type: FrameType,
        rng: &mut R,
    ) -> Result<Bytes, WireError> {
        let encrypted = frame_type.is_encrypted();
        if encrypted && self.session_key.is_none() {
            return Err(WireError::MissingSessionKey);
        }

        let mut padding = 0;
        let mut size = payload.len();
        if encrypted {
            // already aligned data gets no padding, and the header nibble stays 0
            let unaligned = (payload.len() + SEQUENCE_SIZE) % BLOCK_SIZE;
            if unaligned != 0 {
                padding = BLOCK_SIZE - unaligned;
            }
            size += padding + SIGNATURE_SIZE;
        }
        let size = u16::try_from(size).map_err(|_| WireError::Length(size))?;

        let mut header = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        header.put_slice(&FRAME_MAGIC);
        header.put_u16(size);
        header.put_u8(FRAME_FIXED_BYTE);
        header.put_u8(((padding as u8) << 4) | frame_type as u8);

        let mut data = Vec::with_capacity(SEQUENCE_SIZE + payload.len() + padding);
        data.extend_from_slice(&self.request_count.to_be_bytes());
        data.extend_from_slice(payload);
        if padding > 0 {
            let mut fill = vec![0u8; padding];
            rng.fill_bytes(&mut fill);
            data.extend_from_slice(&fill);
        }
        self.request_count = self.request_count.wrapping_add(1);

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + data.len() + SIGNATURE_SIZE);
        frame.put_slice(&header);
        if encrypted {
            let mut signed = header.to_vec();
            signed.extend_from_slice(&data);
            let signature = sha256(&signed);

            let key = self.session_key.as_deref().ok_or(WireError::MissingSessionKey)?;
            frame.put_slice(&cbc_encrypt(key, &data)?);
            frame.put_slice(&signature);
        } else {
            frame.put_slice(&data);
        }

        Ok(frame.freeze())
    }

    /// Decode every complete frame in `buf`.
    ///
    /// Returns the payloads in order and the bytes of a trailing partial frame,
    /// which the caller prepends to the next read.
    pub fn decode_frames(&mut self, buf: &[u8]) -> Result<(Vec<Bytes>, Bytes), WireError> {
        let mut frames = Vec::new();
        let mut rest = buf;

        while let Some(size) = frame_length(rest)? {
            if rest.len() < size {
                break;
            }

            let (frame, tail) = rest.split_at(size);
            frames.push(self.decode_one(frame)?);
            rest = tail;
        }

        trace!("Decoded {} frames, {} bytes left over", frames.len(), rest.len());
        Ok((frames, Bytes::copy_from_slice(rest)))
    }

    fn decode_one(&mut self, frame: &[u8]) -> Result<Bytes, WireError> {
        let (header, body) = frame.split_at(FRAME_HEADER_SIZE);
        if header[4] != FRAME_FIXED_BYTE {
            return Err(WireError::MalformedFrame);
        }

        let padding = (header[5] >> 4) as usize;
        let subtype = header[5] & 0x0F;
        let encrypted = match FrameType::try_from(subtype) {
            Ok(frame_type) => frame_type.is_encrypted(),
            Err(_) => {
                warn!("Unknown 8370 frame type {:#x}, reading it as plain", subtype);
                false
            }
        };

        let data = if encrypted {
            if body.len() < SIGNATURE_SIZE {
                return Err(WireError::MalformedFrame);
            }

            let (cipher, signature) = body.split_at(body.len() - SIGNATURE_SIZE);
            let key = self.session_key.as_deref().ok_or(WireError::MissingSessionKey)?;
            let mut plain = cbc_decrypt(key, cipher).map_err(|e| match e {
                WireError::BlockAlignment(_) => WireError::MalformedFrame,
                other => other,
            })?;

            let mut signed = header.to_vec();
            signed.extend_from_slice(&plain);
            if sha256(&signed)[..] != *signature {
                return Err(WireError::SignatureMismatch);
            }

            if padding + SEQUENCE_SIZE > plain.len() {
                return Err(WireError::MalformedFrame);
            }
            plain.truncate(plain.len() - padding);
            plain
        } else {
            body.to_vec()
        };

        if data.len() < SEQUENCE_SIZE {
            return Err(WireError::MalformedFrame);
        }

        self.response_count = u16::from_be_bytes([data[0], data[1]]);
        Ok(Bytes::copy_from_slice(&data[SEQUENCE_SIZE..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const TOKEN: [u8; 64] = hex!(
        "ee755a84a115703768bcc7c6c13d3d629aa416f1e2fd798beb9f78cbb1381d09"
        "1cc245d7b063aad2a900e5b498fbd936c811f5d504b2e656d4f33b3bbc6d1da3"
    );
    const KEY: [u8; 32] = hex!("ed37bd31558a4b039aaf4e7a7a59aa7a75fd9101682045f69baf45d28380ae5c");
    const SIGNATURE: [u8; 32] =
        hex!("ce8cfbf16590d1076df83a3b67cc6bb680f60e3dffe77492144de9d2d5747e6f");
    const SESSION_KEY: [u8; 32] =
        hex!("514b78f39c26610b6a5f507b1b7b5df0c98154c3a18c6ffe6b5f5bd3e2a259d6");

    /// Rng that fills with a constant so frames are reproducible
    struct Fill(u8);

    impl RngCore for Fill {
        fn next_u32(&mut self) -> u32 {
            u32::from_ne_bytes([self.0; 4])
        }

        fn next_u64(&mut self) -> u64 {
            u64::from_ne_bytes([self.0; 8])
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            dest.fill(self.0);
            Ok(())
        }
    }

    fn handshake_response() -> Vec<u8> {
        let mut response = vec![0u8; 32];
        response.extend_from_slice(&SIGNATURE);
        response
    }

    fn established() -> FrameCodec {
        let mut codec = FrameCodec::new();
        codec.derive_session_key(&handshake_response(), &KEY).unwrap();
        codec
    }

    #[test]
    fn test_handshake_request_frame() {
        let mut codec = FrameCodec::new();
        let frame = codec.handshake_request(&TOKEN).unwrap();

        assert_eq!(&frame[..8], &hex!("8370004020000000"));
        assert_eq!(&frame[8..], &TOKEN[..]);
        assert_eq!(codec.request_count(), 1);
    }

    #[test]
    fn test_derive_session_key() {
        let mut codec = FrameCodec::new();
        codec.handshake_request(&TOKEN).unwrap();

        let key = codec.derive_session_key(&handshake_response(), &KEY).unwrap();
        assert_eq!(key, SESSION_KEY.to_vec());
        assert_eq!(codec.session_key(), Some(&SESSION_KEY[..]));
        assert_eq!(codec.request_count(), 0);
        assert_eq!(codec.response_count(), 0);
    }

    #[test]
    fn test_derive_session_key_failures() {
        let mut codec = FrameCodec::new();
        assert_eq!(
            codec.derive_session_key(b"ERROR", &KEY),
            Err(WireError::AuthenticationFailed)
        );
        assert_eq!(
            codec.derive_session_key(&[0u8; 63], &KEY),
            Err(WireError::AuthenticationFailed)
        );

        let mut response = handshake_response();
        response[40] ^= 0x01;
        assert_eq!(
            codec.derive_session_key(&response, &KEY),
            Err(WireError::SignatureMismatch)
        );
        assert!(codec.session_key().is_none());
    }

    #[test]
    fn test_decode_known_encrypted_frame() {
        let frame = hex!(
            "8370002e2073c26cdfab1443778f6a572231c9d83edf7d3a755fcb6e9a4de3cc"
            "1c359d15e565f5937033f6fd62f7c7ab33a6cab62a68"
        );
        let mut codec = established();
        let (frames, rest) = codec.decode_frames(&frame).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"\x5a\x5ahello");
        assert!(rest.is_empty());
        assert_eq!(codec.response_count(), 7);
    }

    #[test]
    fn test_encode_matches_reference_layout() {
        let mut codec = established();
        for _ in 0..7 {
            codec.encode(b"x", FrameType::EncryptedRequest).unwrap();
        }

        let frame = codec
            .encode_with_rng(b"\x5a\x5ahello", FrameType::EncryptedResponse, &mut Fill(0xAA))
            .unwrap();
        assert_eq!(
            &frame[..],
            &hex!(
                "8370002e2073c26cdfab1443778f6a572231c9d83edf7d3a755fcb6e9a4de3cc"
                "1c359d15e565f5937033f6fd62f7c7ab33a6cab62a68"
            )[..]
        );
    }

    #[test]
    fn test_aligned_payload_gets_no_padding() {
        let mut codec = established();
        let frame = codec.encode(&[0x5A; 14], FrameType::EncryptedRequest).unwrap();

        assert_eq!(frame[5] >> 4, 0);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 14 + 32);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + 16 + SIGNATURE_SIZE);

        let (frames, _) = established().decode_frames(&frame).unwrap();
        assert_eq!(&frames[0][..], &[0x5A; 14]);
    }

    #[test]
    fn test_unknown_frame_type_read_as_plain() {
        let frame = hex!("83700003200500 09 aabbcc");
        assert_eq!(frame_length(&frame), Ok(Some(11)));

        let mut codec = FrameCodec::new();
        let (frames, rest) = codec.decode_frames(&frame).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[0xAA, 0xBB, 0xCC])]);
        assert!(rest.is_empty());
        assert_eq!(codec.response_count(), 9);
    }

    #[test]
    fn test_encrypted_roundtrip_and_alignment() {
        let mut sender = established();
        let mut receiver = established();

        for len in [0usize, 1, 13, 14, 15, 30, 46, 200] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame = sender.encode(&payload, FrameType::EncryptedRequest).unwrap();
            assert_eq!((frame.len() - FRAME_HEADER_SIZE - SIGNATURE_SIZE) % BLOCK_SIZE, 0);

            let (frames, rest) = receiver.decode_frames(&frame).unwrap();
            assert_eq!(frames, vec![Bytes::from(payload)]);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let mut sender = established();
        let mut frame = sender.encode(b"payload", FrameType::EncryptedRequest).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        let mut receiver = established();
        assert_eq!(receiver.decode_frames(&frame), Err(WireError::SignatureMismatch));

        let mut wrong_key = FrameCodec::new();
        wrong_key.session_key = Some(vec![0x55; 32]);
        let frame = sender.encode(b"payload", FrameType::EncryptedRequest).unwrap();
        assert_eq!(wrong_key.decode_frames(&frame), Err(WireError::SignatureMismatch));
    }

    #[test]
    fn test_segmentation_independent() {
        let mut sender = established();
        let mut stream = Vec::new();
        for payload in [&b"first"[..], &b"a somewhat longer second payload"[..], &b"3"[..]] {
            stream.extend_from_slice(&sender.encode(payload, FrameType::EncryptedRequest).unwrap());
        }

        let (whole, rest) = established().decode_frames(&stream).unwrap();
        assert_eq!(whole.len(), 3);
        assert!(rest.is_empty());

        for split in 0..=stream.len() {
            let mut receiver = established();
            let (mut frames, rest) = receiver.decode_frames(&stream[..split]).unwrap();

            let mut next = rest.to_vec();
            next.extend_from_slice(&stream[split..]);
            let (more, rest) = receiver.decode_frames(&next).unwrap();
            frames.extend(more);

            assert_eq!(frames, whole, "split at {}", split);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_partial_and_malformed_input() {
        let mut codec = established();
        let (frames, rest) = codec.decode_frames(&[0x83, 0x70, 0x00]).unwrap();
        assert!(frames.is_empty());
        assert_eq!(&rest[..], &[0x83, 0x70, 0x00]);

        assert_eq!(
            codec.decode_frames(&[0x5A, 0x5A, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00]),
            Err(WireError::MalformedFrame)
        );
        assert_eq!(
            codec.decode_frames(&[0x83, 0x70, 0x00, 0x00, 0x21, 0x00, 0x00, 0x00]),
            Err(WireError::MalformedFrame)
        );
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let mut codec = established();
        for _ in 0..65_535 {
            codec.encode(&[], FrameType::HandshakeRequest).unwrap();
        }
        assert_eq!(codec.request_count(), 65_535);

        let frame = codec.encode(b"x", FrameType::EncryptedRequest).unwrap();
        assert_eq!(codec.request_count(), 0);

        let mut receiver = established();
        receiver.decode_frames(&frame).unwrap();
        assert_eq!(receiver.response_count(), 65_535);

        codec.derive_session_key(&handshake_response(), &KEY).unwrap();
        assert_eq!(codec.request_count(), 0);
    }

    #[test]
    fn test_encrypted_frame_requires_session_key() {
        let mut codec = FrameCodec::new();
        assert_eq!(
            codec.encode(b"x", FrameType::EncryptedRequest),
            Err(WireError::MissingSessionKey)
        );
    }
}
