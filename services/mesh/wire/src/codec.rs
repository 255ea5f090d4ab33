//! AES-128-GCM helpers for handshake proofs, key derivation and packet sealing.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::cipher::BlockEncrypt;
use aes_gcm::aes::Aes128;
use aes_gcm::{Aes128Gcm, Key, Nonce};
use bytes::Bytes;

use crate::WireError;

/// Authentication tag appended to every sealed packet
pub const MIC_SIZE: usize = 16;

/// AES-GCM nonce length
const NONCE_SIZE: usize = 12;

fn cipher(key: &[u8; 16]) -> Aes128Gcm {
    Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(key))
}

/// Per-packet nonce: direction byte, three zero bytes, little endian counter
pub fn packet_nonce(direction: u8, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = direction;
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt `plaintext`, returning ciphertext followed by the tag
pub fn seal_packet(
    key: &[u8; 16],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Bytes, WireError> {
    cipher(key)
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map(Bytes::from)
        .map_err(|_| WireError::Crypto)
}

/// Verify and decrypt a sealed packet
pub fn open_packet(
    key: &[u8; 16],
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> Result<Bytes, WireError> {
    if sealed.len() < MIC_SIZE {
        return Err(WireError::Incomplete);
    }
    cipher(key)
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map(Bytes::from)
        .map_err(|_| WireError::Crypto)
}

/// One 16-byte keystream block of `key` at `nonce`.
///
/// Used as a keyed pseudo random function for deriving session and
/// restrained keys.
pub fn keystream_block(key: &[u8; 16], nonce: &[u8; NONCE_SIZE]) -> Result<[u8; 16], WireError> {
    let sealed = cipher(key)
        .encrypt(Nonce::from_slice(nonce), &[0u8; 16][..])
        .map_err(|_| WireError::Crypto)?;
    let mut block = [0u8; 16];
    block.copy_from_slice(&sealed[..16]);
    Ok(block)
}

/// Plain AES-128 of a single block (ECB, no nonce)
pub fn encrypt_block(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let mut block = GenericArray::clone_from_slice(plaintext);
    Aes128::new(GenericArray::from_slice(key)).encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out
}

/// Tag authenticating `aad` under `key` at `nonce`
pub fn proof_tag(
    key: &[u8; 16],
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<[u8; MIC_SIZE], WireError> {
    let tag = cipher(key)
        .encrypt(Nonce::from_slice(nonce), Payload { msg: &[], aad })
        .map_err(|_| WireError::Crypto)?;
    let mut proof = [0u8; MIC_SIZE];
    proof.copy_from_slice(&tag[..MIC_SIZE]);
    Ok(proof)
}
