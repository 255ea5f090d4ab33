//! Serial number, node id and BLE address lookup

use mesh_wire::{BleAddress, NodeId};
use std::collections::HashMap;

/// Resolves devices a node has heard of
pub trait NodeResolver: Send + std::fmt::Debug {
    /// BLE address advertised for a serial number
    fn address_for_serial(&self, serial: &str) -> Option<BleAddress>;

    /// BLE address of an enrolled node
    fn address_for_node(&self, node_id: NodeId) -> Option<BleAddress>;

    /// Node id behind a BLE address
    fn node_for_address(&self, address: &BleAddress) -> Option<NodeId>;
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    node_id: Option<NodeId>,
    address: BleAddress,
}

/// In-memory directory filled from scan results or configuration
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    by_serial: HashMap<String, DeviceEntry>,
}

impl NodeDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or update a device
    pub fn insert(&mut self, serial: impl Into<String>, node_id: Option<NodeId>, address: BleAddress) {
        self.by_serial
            .insert(serial.into(), DeviceEntry { node_id, address });
    }

    /// Forget a device
    pub fn remove(&mut self, serial: &str) -> bool {
        self.by_serial.remove(serial).is_some()
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.by_serial.len()
    }

    /// No devices known
    pub fn is_empty(&self) -> bool {
        self.by_serial.is_empty()
    }
}

impl NodeResolver for NodeDirectory {
    fn address_for_serial(&self, serial: &str) -> Option<BleAddress> {
        self.by_serial.get(serial).map(|e| e.address)
    }

    fn address_for_node(&self, node_id: NodeId) -> Option<BleAddress> {
        self.by_serial
            .values()
            .find(|e| e.node_id == Some(node_id))
            .map(|e| e.address)
    }

    fn node_for_address(&self, address: &BleAddress) -> Option<NodeId> {
        self.by_serial
            .values()
            .find(|e| &e.address == address)
            .and_then(|e| e.node_id)
    }
}
