//! Channel payload encryption.
//!
//! Meshtastic channels encrypt the serialized `Data` message with AES in counter mode.
//! The initial counter block is derived from the packet itself, so encryption and
//! decryption are the same keystream operation and need no IV on the wire:
//!
//! ```text
//! [ packet id as u64 LE (8 bytes) | sender node id as u64 LE (8 bytes) ]
//! ```
//!
//! The block is used as a 128-bit big-endian counter. Reusing a (packet id, sender)
//! pair under the same key reuses the keystream, so outbound packets always get a
//! fresh random id.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const NONCE_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length {0} (expected 16 or 32 bytes)")]
    InvalidKeyLength(usize),
}

/// Initial counter block for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn new(packet_id: u32, sender_id: u32) -> Self {
        let mut block = [0u8; NONCE_LEN];
        block[..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
        block[8..].copy_from_slice(&(sender_id as u64).to_le_bytes());
        Nonce(block)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// XOR `data` in place with the AES-CTR keystream for `key` starting at `counter`.
///
/// The key selects the cipher: 16 bytes for AES-128, 32 bytes for AES-256.
pub fn apply_keystream(
    key: &[u8],
    counter: &[u8; NONCE_LEN],
    data: &mut [u8],
) -> Result<(), CryptoError> {
    match key.len() {
        16 => {
            let mut cipher = Aes128Ctr::new_from_slices(key, counter)
                .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
            cipher.apply_keystream(data);
        }
        32 => {
            let mut cipher = Aes256Ctr::new_from_slices(key, counter)
                .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
            cipher.apply_keystream(data);
        }
        other => return Err(CryptoError::InvalidKeyLength(other)),
    }
    Ok(())
}

pub fn encrypt(key: &[u8], nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut buf = plaintext.to_vec();
    apply_keystream(key, nonce.as_bytes(), &mut buf)?;
    Ok(buf)
}

/// Decrypt a payload. Truncated or foreign ciphertext does not fail here; it yields
/// garbage that the envelope codec rejects when parsing.
pub fn decrypt(key: &[u8], nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt(key, nonce, ciphertext)
}
