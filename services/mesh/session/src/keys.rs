//! Long-term keys per key class.

use mesh_wire::{encrypt_block, FmKeyId};
use std::fmt;
use thiserror::Error;

/// AES-128 key
pub type Key = [u8; 16];

/// Supplied key value meaning "use my own key of this class"
pub const USE_OWN_KEY: Key = [0xFF; 16];

/// Key of the ZERO class
pub const ZERO_KEY: Key = [0; 16];

/// Block encrypted with the node key to get the restrained key
const RESTRAINED_KEY_CLEAR_TEXT: [u8; 16] = *b"RESTRAINED_KEY00";

/// Key parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    /// Not 16 hex encoded bytes
    #[error("key must be 16 hex bytes, got {0:?}")]
    Format(String),
}

/// Parse a key written as 32 hex digits, optionally separated by colons
pub fn parse_key(text: &str) -> Result<Key, KeyParseError> {
    let digits: String = text.chars().filter(|c| *c != ':').collect();
    if digits.len() != 32 || !digits.is_ascii() {
        return Err(KeyParseError::Format(text.to_string()));
    }
    let mut key = [0u8; 16];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
            .map_err(|_| KeyParseError::Format(text.to_string()))?;
    }
    Ok(key)
}

/// Restrained key of a node: AES-128 of `RESTRAINED_KEY00` under its node key
pub fn derive_restrained_key(node_key: &Key) -> Key {
    encrypt_block(node_key, &RESTRAINED_KEY_CLEAR_TEXT)
}

/// Keys this node owns, one per configurable class
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyStore {
    /// Pairwise node key
    pub node_key: Option<Key>,
    /// Shared network key
    pub network_key: Option<Key>,
    /// Shared organization key
    pub organization_key: Option<Key>,
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("node_key", &self.node_key.is_some())
            .field("network_key", &self.network_key.is_some())
            .field("organization_key", &self.organization_key.is_some())
            .finish()
    }
}

impl KeyStore {
    /// Own key of a class
    pub fn key_for(&self, key_id: FmKeyId) -> Option<Key> {
        match key_id {
            FmKeyId::Zero => Some(ZERO_KEY),
            FmKeyId::Node => self.node_key,
            FmKeyId::Network => self.network_key,
            FmKeyId::Organization => self.organization_key,
            FmKeyId::Restrained => self.node_key.as_ref().map(derive_restrained_key),
        }
    }

    /// Key to initiate with: the supplied one, or the own one if none or
    /// [`USE_OWN_KEY`] was supplied
    pub fn resolve(&self, key_id: FmKeyId, supplied: Option<Key>) -> Option<Key> {
        if key_id == FmKeyId::Zero {
            return Some(ZERO_KEY);
        }
        match supplied {
            Some(key) if key != USE_OWN_KEY => Some(key),
            _ => self.key_for(key_id),
        }
    }
}
