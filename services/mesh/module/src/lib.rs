//! Mesh access module: owns the tunnels of a node.
//!
//! [`MeshAccessModule`] keeps a fixed number of connection slots, opens
//! tunnels on request (directly by BLE address or by serial number through a
//! [`NodeResolver`]), leases serial connections, routes local traffic into
//! tunnels and feeds received time sync into the node's
//! [`TimeManager`](mesh_timesync::TimeManager). State changes leave the
//! module as JSON events through the [`EventNotifier`].
//!
//! Everything is driven from outside: link events, commands and the tick
//! callback. Nothing blocks and nothing runs in the background.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod events;
pub mod fabric;
pub mod module;

pub use config::MeshAccessConfig;
pub use directory::{NodeDirectory, NodeResolver};
pub use events::{
    ConnStateEvent, EventNotifier, EventType, MeshAccessEvent, SerialConnectCode, SerialConnectResponse,
    MESH_ACCESS_MODULE_ID,
};
pub use fabric::{FabricEvent, FabricPort, LinkFabric};
pub use module::MeshAccessModule;

use bytes::Bytes;
use mesh_session::{ConnectionError, ConnectionHandle, Key, TransportError};
use mesh_timesync::TimeError;
use mesh_wire::{BleAddress, FmKeyId, NodeId, TunnelType};
use thiserror::Error;

/// Module errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// Connection could not be created
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
    /// Transport refused to open a link
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// Time manager setup failed
    #[error("time: {0}")]
    Time(#[from] TimeError),
    /// A tunnel with different parameters already uses the address
    #[error("already connected to {0} with different parameters")]
    AlreadyConnected(BleAddress),
    /// All connection slots taken
    #[error("no free connection slot")]
    NoFreeSlot,
    /// Nothing matches the disconnect target
    #[error("no such connection")]
    NotFound,
    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Open a tunnel to a known BLE address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Partner address
    pub address: BleAddress,
    /// Key class
    pub key_id: FmKeyId,
    /// Key value, `None` for the own key
    pub key: Option<Key>,
    /// Requested tunnel type
    pub tunnel_type: TunnelType,
    /// Echoed in state events
    pub request_handle: u8,
}

/// Open a leased tunnel to a device known by serial number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConnectRequest {
    /// Serial number of the partner
    pub serial: String,
    /// Key class
    pub key_id: FmKeyId,
    /// Key value, `None` for the own key
    pub key: Option<Key>,
    /// Virtual id the partner gets on this node
    pub target_node_id: NodeId,
    /// Seconds to wait for the device and to keep the tunnel open
    pub timeout_seconds: u16,
    /// Echoed in events
    pub request_handle: u8,
    /// Address to use without asking the directory
    pub address_hint: Option<BleAddress>,
    /// Use the longer connect timeout
    pub force_mode: bool,
}

/// Which tunnel to close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectTarget {
    /// Tunnel whose partner has this virtual id
    PartnerId(NodeId),
    /// Tunnel to this address
    Address(BleAddress),
    /// Tunnel in this slot
    Handle(ConnectionHandle),
}

/// Packet leaving a tunnel towards the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshOutput {
    /// For the local application
    DeliverLocal(Bytes),
    /// To be sent into the local mesh
    ForwardToMesh(Bytes),
}
