//! Channel payload encryption used on the public broker feed.
//!
//! Packets are AES-256 in counter mode. The 128-bit initial counter block is
//! built from the packet id and the sender:
//!
//! ```text
//! bytes 0..4   packet id (big endian)
//! bytes 4..8   zero
//! bytes 8..12  sender node number (big endian)
//! bytes 12..16 zero
//! ```
//!
//! The public default channel uses the well-known one-byte key `0x01`, which
//! is expanded to 32 bytes by cyclic repetition.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use thiserror::Error;

/// Key of the public default channel.
pub const DEFAULT_KEY: [u8; 1] = [0x01];
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("channel key is empty")]
    EmptyKey,
}

/// Repeat (or truncate) `key` to exactly 32 bytes.
pub fn expand_key(key: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    if key.is_empty() {
        return Err(CryptoError::EmptyKey);
    }
    let mut out = [0u8; KEY_LEN];
    for (i, b) in out.iter_mut().enumerate() {
        *b = key[i % key.len()];
    }
    Ok(out)
}

pub fn packet_nonce(packet_id: u32, sender: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..4].copy_from_slice(&packet_id.to_be_bytes());
    nonce[8..12].copy_from_slice(&sender.to_be_bytes());
    nonce
}

fn apply(data: &[u8], key: &[u8], packet_id: u32, sender: u32) -> Result<Vec<u8>, CryptoError> {
    let key = expand_key(key)?;
    let nonce = packet_nonce(packet_id, sender);
    let mut out = data.to_vec();
    let mut cipher = Ctr128BE::<Aes256>::new((&key).into(), &nonce.into());
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// Decrypt a packet body. A wrong key or nonce yields garbage, not an error;
/// the protobuf decode that follows is what rejects it.
pub fn decrypt_packet(
    ciphertext: &[u8],
    key: &[u8],
    packet_id: u32,
    sender: u32,
) -> Result<Vec<u8>, CryptoError> {
    apply(ciphertext, key, packet_id, sender)
}

/// Encrypt a packet body (counter mode is symmetric).
pub fn encrypt_packet(
    plaintext: &[u8],
    key: &[u8],
    packet_id: u32,
    sender: u32,
) -> Result<Vec<u8>, CryptoError> {
    apply(plaintext, key, packet_id, sender)
}
