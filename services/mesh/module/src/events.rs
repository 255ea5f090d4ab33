//! JSON events reported by the mesh access module

use mesh_wire::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Module id carried in every event
pub const MESH_ACCESS_MODULE_ID: u8 = 10;

/// Event discriminator, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Tunnel state change
    MaConnState,
    /// Answer to a serial connect
    SerialConnectResponse,
}

/// Result code of a serial connect
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialConnectCode {
    /// Tunnel is up
    Success = 0,
    /// Device not found or not reachable in time
    Timeout = 1,
    /// No connection slot left
    NoFreeSlot = 2,
    /// Partner or local policy refused the tunnel
    Rejected = 3,
}

/// `ma_conn_state` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnStateEvent {
    /// Reporting node
    pub node_id: NodeId,
    /// Always [`EventType::MaConnState`]
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Always [`MESH_ACCESS_MODULE_ID`]
    pub module: u8,
    /// Handle of the connect request
    pub request_handle: u8,
    /// Virtual id of the partner
    pub partner_id: NodeId,
    /// Numeric connection state
    pub state: u8,
}

/// `serial_connect_response` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConnectResponse {
    /// Always [`EventType::SerialConnectResponse`]
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Always [`MESH_ACCESS_MODULE_ID`]
    pub module: u8,
    /// Reporting node
    pub node_id: NodeId,
    /// Handle of the serial connect request
    pub request_handle: u8,
    /// [`SerialConnectCode`] value
    pub code: u8,
    /// Virtual id the partner got
    pub partner_id: NodeId,
}

/// Any event of the module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeshAccessEvent {
    /// Tunnel state change
    ConnState(ConnStateEvent),
    /// Serial connect answer
    SerialConnect(SerialConnectResponse),
}

impl MeshAccessEvent {
    /// Compact JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Publishes module events to an optional channel and the log
#[derive(Debug, Clone)]
pub struct EventNotifier {
    node_id: NodeId,
    event_tx: Option<mpsc::UnboundedSender<MeshAccessEvent>>,
    sequence_counter: Arc<AtomicU64>,
}

impl EventNotifier {
    /// Notifier sending into `event_tx`
    pub fn new(node_id: NodeId, event_tx: mpsc::UnboundedSender<MeshAccessEvent>) -> Self {
        Self {
            node_id,
            event_tx: Some(event_tx),
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Notifier that only logs
    pub fn log_only(node_id: NodeId) -> Self {
        Self {
            node_id,
            event_tx: None,
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Notifier plus the receiving end of its channel
    pub fn channel(node_id: NodeId) -> (Self, mpsc::UnboundedReceiver<MeshAccessEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(node_id, tx), rx)
    }

    /// Node the events are reported for
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn send_event(&self, event: MeshAccessEvent) {
        let sequence = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        info!("{}", event.to_json());
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                debug!("Event receiver gone, dropped event {}", sequence);
            }
        }
    }

    /// Report a tunnel state change
    pub fn conn_state(&self, request_handle: u8, partner_id: NodeId, state: u8) {
        self.send_event(MeshAccessEvent::ConnState(ConnStateEvent {
            node_id: self.node_id,
            event_type: EventType::MaConnState,
            module: MESH_ACCESS_MODULE_ID,
            request_handle,
            partner_id,
            state,
        }));
    }

    /// Answer a serial connect
    pub fn serial_connect_response(
        &self,
        request_handle: u8,
        code: SerialConnectCode,
        partner_id: NodeId,
    ) {
        self.send_event(MeshAccessEvent::SerialConnect(SerialConnectResponse {
            event_type: EventType::SerialConnectResponse,
            module: MESH_ACCESS_MODULE_ID,
            node_id: self.node_id,
            request_handle,
            code: code as u8,
            partner_id,
        }));
    }
}
