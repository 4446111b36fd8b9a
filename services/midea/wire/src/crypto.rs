//! Payload ciphers and digests.
//!
//! Two AES modes are in use:
//!
//! - **ECB with the library key**: device independent, protects the envelope
//!   inside 5A5A packets and the discovery replies.
//! - **CBC with a zero IV**: keyed with the provisioning key during the handshake
//!   and with the derived session key for 8370 frames.

use crate::WireError;
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use md5::Md5;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Library key seed shared by every appliance
const LIBRARY_KEY_SEED: u128 = 141_661_095_494_369_103_254_425_781_617_665_632_877;

/// Salt appended before computing packet signatures
const SIGN_SALT: &[u8] = b"xhdiwjnchekd4d512chdjx5d8e4c394D2D7S";

static LIBRARY_KEY: Lazy<[u8; 16]> = Lazy::new(|| LIBRARY_KEY_SEED.to_be_bytes());

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Byte layout used to derive the UDP id of an appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpIdMethod {
    /// 8-byte big-endian id, reversed
    ReversedBig,
    /// 6-byte big-endian id
    Big,
    /// 6-byte little-endian id
    Little,
}

/// Encrypt with the library key (AES-128-ECB, PKCS#7)
pub fn ecb_encrypt(data: &[u8]) -> Vec<u8> {
    ecb::Encryptor::<Aes128>::new(GenericArray::from_slice(&LIBRARY_KEY[..]))
        .encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// Decrypt with the library key.
///
/// Returns an empty vector when the input is not block aligned or the
/// padding is invalid.
pub fn ecb_decrypt(data: &[u8]) -> Vec<u8> {
    ecb::Decryptor::<Aes128>::new(GenericArray::from_slice(&LIBRARY_KEY[..]))
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .unwrap_or_default()
}

/// AES-CBC encrypt with an all-zero IV, no padding. Key may be 16, 24 or 32 bytes.
pub fn cbc_encrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(WireError::BlockAlignment(data.len()));
    }

    let invalid = |_| WireError::KeyLength(key.len());
    match key.len() {
        16 => Ok(cbc::Encryptor::<Aes128>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<NoPadding>(data)),
        24 => Ok(cbc::Encryptor::<Aes192>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<NoPadding>(data)),
        32 => Ok(cbc::Encryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .encrypt_padded_vec_mut::<NoPadding>(data)),
        n => Err(WireError::KeyLength(n)),
    }
}

/// AES-CBC decrypt with an all-zero IV, no padding
pub fn cbc_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(WireError::BlockAlignment(data.len()));
    }

    let invalid = |_| WireError::KeyLength(key.len());
    let plain = match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(data),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(data),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, &ZERO_IV)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<NoPadding>(data),
        n => return Err(WireError::KeyLength(n)),
    };

    plain.map_err(|_| WireError::BlockAlignment(data.len()))
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// MD5 over `data ∥ salt`, used to sign 5A5A packets
pub fn packet_signature(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(SIGN_SALT);
    hasher.finalize().into()
}

/// UDP id of an appliance: SHA-256 of the id bytes, halves folded with XOR, hex encoded
pub fn udp_id(appliance_id: u64, method: UdpIdMethod) -> String {
    let id_bytes: Vec<u8> = match method {
        UdpIdMethod::ReversedBig => appliance_id.to_le_bytes().to_vec(),
        UdpIdMethod::Big => appliance_id.to_be_bytes()[2..].to_vec(),
        UdpIdMethod::Little => appliance_id.to_le_bytes()[..6].to_vec(),
    };

    let digest = sha256(&id_bytes);
    let folded: Vec<u8> = digest[..16]
        .iter()
        .zip(&digest[16..])
        .map(|(a, b)| a ^ b)
        .collect();

    hex::encode(folded)
}
