//! V3 handshake.
//!
//! Right after the TCP connect a V3 device expects the token in a
//! handshake-request frame and answers with a 64-byte challenge from which the
//! session key is derived.

use bytes::{Bytes, BytesMut};
use midea_wire::{frame_length, FrameCodec, WireError, ERROR_SENTINEL};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::device::Credentials;
use crate::error::SessionError;

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Session key, also installed in the codec
    pub session_key: Vec<u8>,
    /// Bytes that followed the handshake response in the same reads
    pub leftover: Bytes,
}

/// Run the handshake and install the session key in `codec`
pub async fn authenticate<S>(
    stream: &mut S,
    codec: &mut FrameCodec,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Handshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = codec.handshake_request(&credentials.token)?;
    stream.write_all(&request).await?;
    debug!("Sent handshake request ({} bytes)", request.len());

    let (response, leftover) =
        tokio::time::timeout(timeout, recv_handshake_response(stream, codec))
            .await
            .map_err(|_| SessionError::Timeout("handshake"))??;

    let session_key = codec.derive_session_key(&response, &credentials.key)?;
    info!("Authentication success");
    if !leftover.is_empty() {
        debug!("{} bytes arrived after the handshake response", leftover.len());
    }
    Ok(Handshake {
        session_key,
        leftover,
    })
}

/// Read until the first complete frame arrives.
///
/// Returns its payload and the undecoded bytes that followed it; frames after
/// the handshake response may be encrypted with the key it yields.
pub async fn recv_handshake_response<R>(
    reader: &mut R,
    codec: &mut FrameCodec,
) -> Result<(Bytes, Bytes), SessionError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buffer = BytesMut::with_capacity(256);
    loop {
        let bytes_read = reader.read_buf(&mut buffer).await?;
        if bytes_read == 0 {
            return Err(SessionError::ConnectionClosed);
        }
        trace!("Read {} handshake bytes, buffer now has {}", bytes_read, buffer.len());

        if buffer.starts_with(ERROR_SENTINEL) {
            return Err(WireError::AuthenticationFailed.into());
        }

        let Some(len) = frame_length(&buffer)? else {
            continue;
        };
        if buffer.len() < len {
            continue;
        }

        let leftover = buffer.split_off(len).freeze();
        let (frames, _) = codec.decode_frames(&buffer)?;
        let frame = frames.into_iter().next().ok_or(WireError::MalformedFrame)?;
        return Ok((frame, leftover));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use midea_wire::FrameType;

    const TOKEN: [u8; 64] = hex!(
        "ee755a84a115703768bcc7c6c13d3d629aa416f1e2fd798beb9f78cbb1381d09"
        "1cc245d7b063aad2a900e5b498fbd936c811f5d504b2e656d4f33b3bbc6d1da3"
    );
    const KEY: [u8; 32] = hex!("ed37bd31558a4b039aaf4e7a7a59aa7a75fd9101682045f69baf45d28380ae5c");
    const SIGNATURE: [u8; 32] =
        hex!("ce8cfbf16590d1076df83a3b67cc6bb680f60e3dffe77492144de9d2d5747e6f");
    const SESSION_KEY: [u8; 32] =
        hex!("514b78f39c26610b6a5f507b1b7b5df0c98154c3a18c6ffe6b5f5bd3e2a259d6");

    fn credentials() -> Credentials {
        Credentials {
            token: TOKEN.to_vec(),
            key: KEY.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (mut client, mut device) = tokio::io::duplex(1024);

        let device_task = tokio::spawn(async move {
            let mut device_codec = FrameCodec::new();
            let (token, _) = recv_handshake_response(&mut device, &mut device_codec)
                .await
                .unwrap();

            let mut response = vec![0u8; 32];
            response.extend_from_slice(&SIGNATURE);
            let frame = device_codec
                .encode(&response, FrameType::HandshakeResponse)
                .unwrap();
            device.write_all(&frame).await.unwrap();
            token
        });

        let mut codec = FrameCodec::new();
        let handshake =
            authenticate(&mut client, &mut codec, &credentials(), Duration::from_secs(10))
                .await
                .unwrap();

        assert_eq!(handshake.session_key, SESSION_KEY.to_vec());
        assert!(handshake.leftover.is_empty());
        assert_eq!(codec.session_key(), Some(&SESSION_KEY[..]));
        assert_eq!(codec.request_count(), 0);
        assert_eq!(&device_task.await.unwrap()[..], &TOKEN[..]);
    }

    #[tokio::test]
    async fn test_authenticate_keeps_trailing_frames() {
        let (mut client, mut device) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut device_codec = FrameCodec::new();
            recv_handshake_response(&mut device, &mut device_codec)
                .await
                .unwrap();

            let mut response = vec![0u8; 32];
            response.extend_from_slice(&SIGNATURE);
            let mut burst = device_codec
                .encode(&response, FrameType::HandshakeResponse)
                .unwrap()
                .to_vec();
            device_codec.derive_session_key(&response, &KEY).unwrap();
            let status = device_codec
                .encode(b"\x5a\x5astatus", FrameType::EncryptedResponse)
                .unwrap();
            burst.extend_from_slice(&status);
            device.write_all(&burst).await.unwrap();
        });

        let mut codec = FrameCodec::new();
        let handshake =
            authenticate(&mut client, &mut codec, &credentials(), Duration::from_secs(10))
                .await
                .unwrap();
        assert!(!handshake.leftover.is_empty());

        let (frames, rest) = codec.decode_frames(&handshake.leftover).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"\x5a\x5astatus")]);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_error_sentinel() {
        let (mut client, mut device) = tokio::io::duplex(1024);
        device.write_all(b"ERROR").await.unwrap();

        let mut codec = FrameCodec::new();
        let result =
            authenticate(&mut client, &mut codec, &credentials(), Duration::from_secs(10)).await;

        assert!(matches!(
            result,
            Err(SessionError::Wire(WireError::AuthenticationFailed))
        ));
        assert!(codec.session_key().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_timeout() {
        let (mut client, _device) = tokio::io::duplex(1024);

        let mut codec = FrameCodec::new();
        let result =
            authenticate(&mut client, &mut codec, &credentials(), Duration::from_secs(10)).await;

        assert!(matches!(result, Err(SessionError::Timeout("handshake"))));
    }
}
