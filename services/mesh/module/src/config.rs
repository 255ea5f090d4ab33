//! Mesh access module configuration

use mesh_session::{parse_key, ConnectionContext, KeyStore};
use mesh_timesync::DeviceType;
use mesh_wire::{NetworkId, NodeId, MIC_SIZE, PACKET_HEADER_SIZE, SPLIT_HEADER_SIZE};
use serde::{Deserialize, Serialize};

use crate::ModuleError;

/// Smallest raw chunk the tunnels can work with
pub const MIN_LINK_MTU: usize = 32;

/// Connection slots at most; each slot owns a block of virtual ids
pub const MAX_CONNECTION_SLOTS: usize = 32;

/// Settings of one node's mesh access module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshAccessConfig {
    /// Own node id
    pub node_id: NodeId,
    /// Own network id
    pub network_id: NetworkId,
    /// Device type
    pub device_type: DeviceType,
    /// Serial number
    pub serial: String,
    /// Node key, hex
    pub node_key: Option<String>,
    /// Network key, hex
    pub network_key: Option<String>,
    /// Organization key, hex
    pub organization_key: Option<String>,
    /// Accept and open ZERO key tunnels
    pub allow_unenrolled_unsecure_connections: bool,
    /// Connection slots
    pub max_connections: usize,
    /// Largest raw chunk on a link
    pub link_mtu: usize,
    /// Largest packet a tunnel carries
    pub max_packet_size: usize,
    /// Link setup timeout, deciseconds
    pub connect_timeout_ds: u32,
    /// Link setup timeout of forced serial connects, deciseconds
    pub force_connect_timeout_ds: u32,
    /// Handshake timeout, deciseconds
    pub handshake_timeout_ds: u32,
    /// Queue bytes per priority class
    pub queue_capacity_bytes: usize,
    /// Queued messages per priority class
    pub queue_max_messages: usize,
}

impl Default for MeshAccessConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            network_id: 1,
            device_type: DeviceType::Static,
            serial: "BBBBB".to_string(),
            node_key: None,
            network_key: None,
            organization_key: None,
            allow_unenrolled_unsecure_connections: false,
            max_connections: 3,
            link_mtu: 64,
            max_packet_size: 512,
            connect_timeout_ds: 100,
            force_connect_timeout_ds: 150,
            handshake_timeout_ds: 100,
            queue_capacity_bytes: 2048,
            queue_max_messages: 16,
        }
    }
}

impl MeshAccessConfig {
    /// Check ranges
    pub fn validate(&self) -> Result<(), ModuleError> {
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTION_SLOTS {
            return Err(ModuleError::Config(format!(
                "max_connections must be 1..={}, got {}",
                MAX_CONNECTION_SLOTS, self.max_connections
            )));
        }
        if self.link_mtu < MIN_LINK_MTU {
            return Err(ModuleError::Config(format!(
                "link_mtu must be at least {}, got {}",
                MIN_LINK_MTU, self.link_mtu
            )));
        }
        let smallest_chunk = self.link_mtu - MIC_SIZE - SPLIT_HEADER_SIZE;
        if self.max_packet_size < PACKET_HEADER_SIZE
            || self.max_packet_size > smallest_chunk * mesh_wire::MAX_CHUNKS_PER_MESSAGE
        {
            return Err(ModuleError::Config(format!(
                "max_packet_size {} does not fit a link mtu of {}",
                self.max_packet_size, self.link_mtu
            )));
        }
        if self.queue_capacity_bytes < self.max_packet_size || self.queue_max_messages == 0 {
            return Err(ModuleError::Config(
                "queues must hold at least one packet of max_packet_size".to_string(),
            ));
        }
        Ok(())
    }

    /// Keys parsed from their hex form
    pub fn key_store(&self) -> Result<KeyStore, ModuleError> {
        let parse = |name: &str, value: &Option<String>| {
            value
                .as_deref()
                .map(parse_key)
                .transpose()
                .map_err(|e| ModuleError::Config(format!("{}: {}", name, e)))
        };
        Ok(KeyStore {
            node_key: parse("node_key", &self.node_key)?,
            network_key: parse("network_key", &self.network_key)?,
            organization_key: parse("organization_key", &self.organization_key)?,
        })
    }

    /// Settings shared by the node's connections
    pub fn connection_context(&self) -> Result<ConnectionContext, ModuleError> {
        self.validate()?;
        Ok(ConnectionContext {
            node_id: self.node_id,
            network_id: self.network_id,
            keys: self.key_store()?,
            allow_unsecure: self.allow_unenrolled_unsecure_connections,
            link_mtu: self.link_mtu,
            max_packet_size: self.max_packet_size,
            connect_timeout_ds: self.connect_timeout_ds,
            handshake_timeout_ds: self.handshake_timeout_ds,
            queue_capacity_bytes: self.queue_capacity_bytes,
            queue_max_messages: self.queue_max_messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MeshAccessConfig::default();
        assert!(config.validate().is_ok());
        let ctx = config.connection_context().unwrap();
        assert_eq!(ctx.link_mtu, 64);
        assert_eq!(ctx.keys, KeyStore::default());
    }

    #[test]
    fn test_small_mtu_is_rejected() {
        let config = MeshAccessConfig {
            link_mtu: 20,
            ..MeshAccessConfig::default()
        };
        assert!(matches!(config.validate(), Err(ModuleError::Config(_))));
    }

    #[test]
    fn test_bad_key_is_rejected() {
        let config = MeshAccessConfig {
            node_key: Some("02:00:zz".to_string()),
            ..MeshAccessConfig::default()
        };
        let err = config.key_store().unwrap_err();
        assert!(err.to_string().contains("node_key"));
    }

    #[test]
    fn test_keys_are_parsed() {
        let config = MeshAccessConfig {
            node_key: Some("02:00:00:00:02:00:00:00:02:00:00:00:02:00:00:00".to_string()),
            ..MeshAccessConfig::default()
        };
        let keys = config.key_store().unwrap();
        assert_eq!(
            keys.node_key,
            Some([2, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0])
        );
        assert_eq!(keys.network_key, None);
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config: MeshAccessConfig =
            serde_yaml::from_str("node_id: 4\nallow_unenrolled_unsecure_connections: true\n")
                .unwrap();
        assert_eq!(config.node_id, 4);
        assert!(config.allow_unenrolled_unsecure_connections);
        assert_eq!(config.max_connections, 3);
    }
}
