//! Visibility rules per key class and tunnel type.

use mesh_wire::{FmKeyId, NodeId, TunnelType, NODE_ID_BROADCAST};

/// What to do with a packet that left a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Hand to this node only
    Local,
    /// Hand to this node and forward into the local mesh
    LocalAndMesh,
    /// Forward into the local mesh
    Mesh,
    /// Out of scope, drop without a reply
    Drop,
}

impl Delivery {
    /// This node consumes the packet
    pub fn is_local(self) -> bool {
        matches!(self, Delivery::Local | Delivery::LocalAndMesh)
    }

    /// The packet continues into the local mesh
    pub fn reaches_mesh(self) -> bool {
        matches!(self, Delivery::Mesh | Delivery::LocalAndMesh)
    }
}

/// Scope granted by the key class of an accepted tunnel.
///
/// `NODE` and `ZERO` reach exactly the accepting node. `NETWORK` and
/// `ORGANIZATION` reach the whole local mesh over a remote mesh tunnel.
/// `RESTRAINED` reaches the mesh for unicast but its broadcasts stay on the
/// accepting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessScope {
    key_id: FmKeyId,
    tunnel_type: TunnelType,
}

impl AccessScope {
    /// Scope of a tunnel
    pub fn new(key_id: FmKeyId, tunnel_type: TunnelType) -> Self {
        Self {
            key_id,
            tunnel_type,
        }
    }

    /// Nodes other than the acceptor are visible
    pub fn exposes_mesh(&self) -> bool {
        self.tunnel_type == TunnelType::RemoteMesh
            && matches!(
                self.key_id,
                FmKeyId::Network | FmKeyId::Organization | FmKeyId::Restrained
            )
    }

    /// Broadcasts from the tunnel spread into the mesh
    pub fn forwards_broadcasts(&self) -> bool {
        self.exposes_mesh() && self.key_id != FmKeyId::Restrained
    }

    /// Decide delivery of a packet arriving at the acceptor
    pub fn inbound(&self, receiver: NodeId, own_id: NodeId) -> Delivery {
        if receiver == NODE_ID_BROADCAST {
            if self.forwards_broadcasts() {
                Delivery::LocalAndMesh
            } else {
                Delivery::Local
            }
        } else if receiver == own_id {
            Delivery::Local
        } else if self.exposes_mesh() {
            Delivery::Mesh
        } else {
            Delivery::Drop
        }
    }

    /// Whether a packet from `sender` in the acceptor's mesh may enter the
    /// tunnel
    pub fn exposes_sender(&self, sender: NodeId, own_id: NodeId) -> bool {
        sender == own_id || self.exposes_mesh()
    }
}
