//! Configuration handling for the mesh access node.
//!
//! Settings come from the shared YAML config file (the `services.meshaccess`
//! section, flat `services.meshaccess.*` keys) and are then overridden by
//! `MESHACCESS_*` environment variables.

use anyhow::{anyhow, bail, Result};
use mesh_module::MeshAccessConfig;
use mesh_wire::{FmKeyId, NodeId, TunnelType};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

const KEY_PREFIX: &str = "services.meshaccess.";

/// A device the node simulates next to itself and tunnels to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    /// Node id of the device
    pub node_id: NodeId,
    /// Serial number it is looked up by
    pub serial: String,
}

/// Mesh access node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Settings of the local mesh access module
    pub mesh: MeshAccessConfig,
    /// Devices to serial connect to
    pub peers: Vec<PeerDevice>,
    /// Key class of the tunnels the node opens
    pub key_id: FmKeyId,
    /// Tunnel type requested for them
    pub tunnel_type: TunnelType,
    /// Seconds a serial connect waits and keeps its tunnel
    pub lease_seconds: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mesh: MeshAccessConfig::default(),
            peers: Vec::new(),
            key_id: FmKeyId::Network,
            tunnel_type: TunnelType::PeerToPeer,
            lease_seconds: 60,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    meshaccess: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)?;
                config.apply_root_config(root)?;
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides()?;
        config.mesh.validate()?;

        info!(
            "Final mesh access configuration: node_id={}, network_id={}, key={:?}, peers={}",
            config.mesh.node_id,
            config.mesh.network_id,
            config.key_id,
            config.peers.len()
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) -> Result<()> {
        let Some(values) = root
            .services
            .and_then(|s| s.meshaccess)
            .and_then(|s| s.config)
        else {
            return Ok(());
        };
        for (key, value) in values {
            match key.strip_prefix(KEY_PREFIX) {
                Some(name) => self.apply_value(name, &value)?,
                None => warn!("Ignoring config key {} outside {}*", key, KEY_PREFIX),
            }
        }
        Ok(())
    }

    /// Apply one setting given by its short name
    pub fn apply_value(&mut self, name: &str, value: &str) -> Result<()> {
        let mesh = &mut self.mesh;
        match name {
            "node_id" => mesh.node_id = value.parse()?,
            "network_id" => mesh.network_id = value.parse()?,
            "serial" => mesh.serial = value.to_string(),
            "node_key" => mesh.node_key = Some(value.to_string()),
            "network_key" => mesh.network_key = Some(value.to_string()),
            "organization_key" => mesh.organization_key = Some(value.to_string()),
            "allow_unsecure" => mesh.allow_unenrolled_unsecure_connections = parse_bool(value)?,
            "max_connections" => mesh.max_connections = value.parse()?,
            "link_mtu" => mesh.link_mtu = value.parse()?,
            "max_packet_size" => mesh.max_packet_size = value.parse()?,
            "connect_timeout_ds" => mesh.connect_timeout_ds = value.parse()?,
            "handshake_timeout_ds" => mesh.handshake_timeout_ds = value.parse()?,
            "key_id" => self.key_id = parse_key_id(value)?,
            "tunnel_type" => {
                self.tunnel_type = match value {
                    "peer_to_peer" => TunnelType::PeerToPeer,
                    "remote_mesh" => TunnelType::RemoteMesh,
                    other => bail!("unknown tunnel type {}", other),
                }
            }
            "lease_seconds" => self.lease_seconds = value.parse()?,
            "peers" => self.peers = parse_peers(value)?,
            _ => warn!("Ignoring unknown config key {}{}", KEY_PREFIX, name),
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) -> Result<()> {
        for (var, name) in [
            ("MESHACCESS_NODE_ID", "node_id"),
            ("MESHACCESS_NETWORK_ID", "network_id"),
            ("MESHACCESS_SERIAL", "serial"),
            ("MESHACCESS_NETWORK_KEY", "network_key"),
            ("MESHACCESS_ALLOW_UNSECURE", "allow_unsecure"),
            ("MESHACCESS_PEERS", "peers"),
        ] {
            if let Ok(value) = std::env::var(var) {
                self.apply_value(name, &value)?;
                info!("{} overridden by environment", name);
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("not a boolean: {}", other),
    }
}

fn parse_key_id(value: &str) -> Result<FmKeyId> {
    Ok(match value {
        "zero" => FmKeyId::Zero,
        "node" => FmKeyId::Node,
        "network" => FmKeyId::Network,
        "organization" => FmKeyId::Organization,
        "restrained" => FmKeyId::Restrained,
        other => bail!("unknown key class {}", other),
    })
}

/// `2:BBBBC,3:BBBBD`
fn parse_peers(value: &str) -> Result<Vec<PeerDevice>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, serial) = entry
                .split_once(':')
                .ok_or_else(|| anyhow!("peer {} is not <node_id>:<serial>", entry))?;
            Ok(PeerDevice {
                node_id: id.trim().parse()?,
                serial: serial.trim().to_string(),
            })
        })
        .collect()
}
