//! Mesh access connections: key negotiation, tunnel scope and chunked links.
//!
//! A [`MeshAccessConnection`] is one tunnel between this node and a partner
//! reached over a raw BLE link. It runs the key handshake, assigns virtual
//! node ids to whatever sits behind the partner, filters traffic by the
//! scope of the key class and moves packets through a
//! [`ChunkedPriorityPacketQueue`](mesh_queue::ChunkedPriorityPacketQueue).
//!
//! ## Connection lifecycle
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> HANDSHAKING -> CONNECTED(4) -> DISCONNECTING -> DISCONNECTED(0)
//!                      \______________\_________________________/
//!                        timeout, wrong key, protocol violation
//! ```
//!
//! The connection never retries on its own; the owner observes state changes
//! through [`ConnectionEvent`]s and decides.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod handshake;
pub mod keys;
pub mod scope;
pub mod transport;
pub mod virtual_ids;

pub use connection::{virtual_id_base, ConnectParams, ConnectionContext, MeshAccessConnection};
pub use keys::{parse_key, Key, KeyParseError, KeyStore, USE_OWN_KEY, ZERO_KEY};
pub use scope::{AccessScope, Delivery};
pub use transport::{LinkHandle, LinkTransport, SendResult, TransportError};
pub use virtual_ids::VirtualIdTable;

use bytes::Bytes;
use mesh_queue::QueueError;
use mesh_wire::{NodeId, TimeSyncMessage, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Virtual ids each tunnel may hand out
pub const MAX_VIRTUAL_IDS_PER_TUNNEL: usize = 8;

/// Tunnel state; the numeric values are reported in state events
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected = 0,
    /// Waiting for the link
    Connecting = 1,
    /// Key exchange in flight
    Handshaking = 2,
    /// Tunnel usable
    Connected = 4,
    /// Tearing down
    Disconnecting = 5,
}

/// Which side opened the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This node asked for the tunnel
    Initiator,
    /// The partner asked for the tunnel
    Acceptor,
}

/// Slot of a connection in its owner
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ma-{}", self.0)
    }
}

/// Shape of the local mesh, sent to partners of remote mesh tunnels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshInfo {
    /// Nodes in the local cluster
    pub cluster_size: u16,
    /// Hops to the nearest sink, -1 without a sink
    pub hops_to_sink: i16,
    /// Node ids of the local cluster
    pub members: Vec<NodeId>,
}

/// Why a tunnel went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit disconnect command
    Command,
    /// The link never came up
    ConnectTimeout,
    /// Handshake did not finish in time
    HandshakeTimeout,
    /// Key class refused or proof mismatch
    HandshakeFailed,
    /// Malformed, out of order or unauthentic data
    ProtocolViolation,
    /// Transport reported a dead link
    LinkFailed,
    /// Link closed by the other side
    LinkLost,
    /// Serial connect lease expired
    ScheduledRemove,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::Command => "COMMAND",
            DisconnectReason::ConnectTimeout => "CONNECT_TIMEOUT",
            DisconnectReason::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            DisconnectReason::HandshakeFailed => "HANDSHAKE_FAILED",
            DisconnectReason::ProtocolViolation => "PROTOCOL_VIOLATION",
            DisconnectReason::LinkFailed => "LINK_FAILED",
            DisconnectReason::LinkLost => "LINK_LOST",
            DisconnectReason::ScheduledRemove => "SCHEDULED_REMOVE",
        };
        f.write_str(name)
    }
}

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Wire decoding or crypto failure
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    /// Queue refused an operation
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    /// No key known for the class
    #[error("no key for key class {0:?}")]
    KeyUnavailable(mesh_wire::FmKeyId),
    /// ZERO key while unsecure connections are disabled
    #[error("unsecure connections are not allowed")]
    UnsecureNotAllowed,
    /// Handshake rejected
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Message that makes no sense in the current state
    #[error("unexpected message type {0} in state {1:?}")]
    UnexpectedMessage(u8, ConnectionState),
    /// Virtual id arena full
    #[error("virtual ids exhausted")]
    VirtualIdsExhausted,
    /// Tunnel not usable
    #[error("not connected")]
    NotConnected,
    /// Transport reported a failed send
    #[error("link failed")]
    LinkFailed,
}

impl ConnectionError {
    /// Disconnect reason for an error that kills the tunnel
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            ConnectionError::HandshakeFailed(_)
            | ConnectionError::KeyUnavailable(_)
            | ConnectionError::UnsecureNotAllowed => DisconnectReason::HandshakeFailed,
            ConnectionError::LinkFailed => DisconnectReason::LinkFailed,
            _ => DisconnectReason::ProtocolViolation,
        }
    }
}

/// Something the owner of a connection has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Tunnel reached `Connected` or `Disconnected`
    StateChanged(ConnectionState),
    /// Application packet left the tunnel, sender already remapped
    Packet {
        /// Encoded packet
        packet: Bytes,
        /// Where it goes
        delivery: Delivery,
    },
    /// Time sync message from the partner
    TimeSync {
        /// Virtual id of the partner
        sender: NodeId,
        /// Message body
        message: TimeSyncMessage,
    },
    /// Partner described its mesh
    ClusterInfo {
        /// Partner cluster size
        cluster_size: u16,
        /// Partner hops to sink
        hops_to_sink: i16,
    },
}
