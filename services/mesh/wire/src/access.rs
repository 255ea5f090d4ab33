//! Key classes and tunnel types negotiated for a mesh access tunnel.

use serde::{Deserialize, Serialize};

/// Key class used to authenticate and scope a tunnel
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FmKeyId {
    /// No encryption, only honoured when unsecure connections are allowed
    Zero = 0,
    /// Per-node key, grants access to exactly the addressed node
    Node = 1,
    /// Shared network key
    Network = 2,
    /// Shared organization key
    Organization = 4,
    /// Network-like key with a stricter broadcast policy
    Restrained = 5,
}

impl FmKeyId {
    /// Wire value
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Highest tunnel type this key class may carry
    pub fn max_tunnel_type(self) -> TunnelType {
        match self {
            FmKeyId::Zero | FmKeyId::Node => TunnelType::PeerToPeer,
            FmKeyId::Network | FmKeyId::Organization | FmKeyId::Restrained => {
                TunnelType::RemoteMesh
            }
        }
    }
}

impl TryFrom<u32> for FmKeyId {
    type Error = crate::WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FmKeyId::Zero),
            1 => Ok(FmKeyId::Node),
            2 => Ok(FmKeyId::Network),
            4 => Ok(FmKeyId::Organization),
            5 => Ok(FmKeyId::Restrained),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Whether a tunnel exposes only its partner or the partner's whole mesh
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelType {
    /// Only the directly connected partner is reachable
    PeerToPeer = 0,
    /// Every node of the partner's mesh is reachable through virtual ids
    RemoteMesh = 1,
}

impl TryFrom<u8> for TunnelType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TunnelType::PeerToPeer),
            1 => Ok(TunnelType::RemoteMesh),
            _ => Err(crate::WireError::Code(value as u32)),
        }
    }
}
