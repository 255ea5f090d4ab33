//! Key handshake for mesh access tunnels.
//!
//! ```text
//! initiator                                  acceptor
//!   | EncryptCustomStart(key id, tunnel, net)  |
//!   |----------------------------------------->|  key class allowed?
//!   |                EncryptCustomANonce(a)    |
//!   |<-----------------------------------------|
//!   | EncryptCustomSNonce(s, proof_i)          |  sk = PRF(key, a, s)
//!   |----------------------------------------->|  verify proof_i
//!   |     EncryptCustomDone(proof_a, metadata) |
//!   |<-----------------------------------------|
//!   verify proof_a                            CONNECTED
//! CONNECTED
//! ```
//!
//! Both proofs are AES-GCM tags under the session key, so each side learns
//! that the other holds the same long-term key without revealing it.

use mesh_wire::{proof_tag, HANDSHAKE_NONCE_SIZE, HANDSHAKE_PROOF_SIZE};
use rand::RngCore;

use crate::keys::Key;
use crate::ConnectionError;

/// Handshake protocol version
pub const HANDSHAKE_VERSION: u8 = 1;

/// Packet nonce direction byte, initiator to acceptor
pub const DIRECTION_FROM_INITIATOR: u8 = 0x10;

/// Packet nonce direction byte, acceptor to initiator
pub const DIRECTION_FROM_ACCEPTOR: u8 = 0x11;

const INITIATOR_PROOF_NONCE: [u8; 12] = [0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
const ACCEPTOR_PROOF_NONCE: [u8; 12] = [0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Handshake nonce
pub type HandshakeNonce = [u8; HANDSHAKE_NONCE_SIZE];

/// Handshake proof
pub type Proof = [u8; HANDSHAKE_PROOF_SIZE];

/// Fresh random nonce
pub fn generate_nonce() -> HandshakeNonce {
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Session key bound to both nonces
pub fn derive_session_key(
    key: &Key,
    anonce: &HandshakeNonce,
    snonce: &HandshakeNonce,
) -> Result<Key, ConnectionError> {
    let mut nonce = [0u8; 12];
    nonce[..6].copy_from_slice(&anonce[..6]);
    nonce[6..].copy_from_slice(&snonce[..6]);
    Ok(mesh_wire::keystream_block(key, &nonce)?)
}

/// Proof the initiator sends over the acceptor nonce
pub fn initiator_proof(session_key: &Key, anonce: &HandshakeNonce) -> Result<Proof, ConnectionError> {
    Ok(proof_tag(session_key, &INITIATOR_PROOF_NONCE, anonce)?)
}

/// Proof the acceptor sends over the initiator nonce
pub fn acceptor_proof(session_key: &Key, snonce: &HandshakeNonce) -> Result<Proof, ConnectionError> {
    Ok(proof_tag(session_key, &ACCEPTOR_PROOF_NONCE, snonce)?)
}

/// Compare proofs without an early exit
pub fn proofs_match(expected: &Proof, received: &Proof) -> bool {
    expected
        .iter()
        .zip(received.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
