//! Node identifiers and BLE addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::WireError;

/// Mesh node identifier
pub type NodeId = u16;

/// Mesh network identifier
pub type NetworkId = u16;

/// Receiver id addressing every node
pub const NODE_ID_BROADCAST: NodeId = 0;

/// First id handed out for nodes reached through an access tunnel
pub const NODE_ID_VIRTUAL_BASE: NodeId = 2000;

/// First group id; virtual ids stay below it
pub const NODE_ID_GROUP_BASE: NodeId = 20000;

/// First id of the range operators assign to assets on serial connect
pub const NODE_ID_ASSET_BASE: NodeId = 33000;

/// 48-bit BLE device address, printed most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BleAddress(pub [u8; 6]);

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for BleAddress {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or(WireError::Malformed)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| WireError::Malformed)?;
        }
        if parts.next().is_some() {
            return Err(WireError::Malformed);
        }
        Ok(BleAddress(bytes))
    }
}

impl TryFrom<String> for BleAddress {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BleAddress> for String {
    fn from(value: BleAddress) -> Self {
        value.to_string()
    }
}
