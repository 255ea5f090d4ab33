//! Mesh access node binary.
//!
//! Runs the local node next to the devices listed in its `peers` setting on
//! an in-memory link fabric, serial connects to each of them and polls their
//! status through the tunnels until interrupted.

use bytes::Bytes;
use clap::Parser;
use mesh_module::{
    EventNotifier, FabricEvent, LinkFabric, MeshAccessConfig, MeshAccessEvent, MeshAccessModule,
    MeshOutput, NodeDirectory, SerialConnectCode, SerialConnectRequest,
};
use mesh_queue::DeliveryPriority;
use mesh_timesync::TICKS_PER_SECOND;
use mesh_wire::{BleAddress, ModuleAction, NodeId, Packet};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{NodeConfig, PeerDevice};
use logging::MeshLogFormatter;

const STATUS_MODULE_ID: u8 = 3;
const ACTION_GET_DEVICE_INFO: u8 = 0x01;

/// Mesh access node
#[derive(Parser, Debug)]
#[command(name = "meshaccess-node", version, about = "Mesh access tunnels between simulated BLE nodes")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the configured node id
    #[arg(long)]
    node_id: Option<NodeId>,

    /// Simulated radio step, e.g. 100ms
    #[arg(long, default_value = "100ms")]
    tick_interval: humantime::Duration,

    /// Status poll interval, e.g. 5s
    #[arg(long, default_value = "5s")]
    poll_interval: humantime::Duration,

    /// Stop after this long instead of waiting for Ctrl+C
    #[arg(long)]
    run_for: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn address_of(node_id: NodeId) -> BleAddress {
    let [lo, hi] = node_id.to_le_bytes();
    BleAddress([0x00, 0x4d, 0x41, lo, hi, 0xc0])
}

fn ticks_for(interval: Duration) -> u32 {
    let ticks = interval.as_millis() * TICKS_PER_SECOND as u128 / 1000;
    ticks.clamp(1, u32::MAX as u128) as u32
}

struct Device {
    module: MeshAccessModule,
    events: UnboundedReceiver<MeshAccessEvent>,
    serial: String,
}

/// The local node and its peers on one fabric
struct Deployment {
    fabric: LinkFabric,
    devices: Vec<Device>,
    peers: Vec<PeerDevice>,
    connected: BTreeSet<NodeId>,
    statuses: Vec<(NodeId, String)>,
    next_request: u8,
}

impl Deployment {
    fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        let mut deployment = Self {
            fabric: LinkFabric::default(),
            devices: Vec::new(),
            peers: config.peers.clone(),
            connected: BTreeSet::new(),
            statuses: Vec::new(),
            next_request: 0,
        };

        let mut directory = NodeDirectory::new();
        for peer in &config.peers {
            directory.insert(peer.serial.clone(), Some(peer.node_id), address_of(peer.node_id));
        }
        deployment.add_device(config.mesh.clone(), directory)?;

        // Peers share the local node's keys
        for peer in &config.peers {
            let mesh = MeshAccessConfig {
                node_id: peer.node_id,
                serial: peer.serial.clone(),
                ..config.mesh.clone()
            };
            deployment.add_device(mesh, NodeDirectory::new())?;
        }
        Ok(deployment)
    }

    fn add_device(&mut self, config: MeshAccessConfig, directory: NodeDirectory) -> anyhow::Result<()> {
        let address = address_of(config.node_id);
        let serial = config.serial.clone();
        let (notifier, events) = EventNotifier::channel(config.node_id);
        let module = MeshAccessModule::new(config, address, notifier, Box::new(directory))?;
        self.fabric.add_device(address);
        self.devices.push(Device {
            module,
            events,
            serial,
        });
        Ok(())
    }

    fn local(&self) -> &MeshAccessModule {
        &self.devices[0].module
    }

    /// Serial connect the local node to every peer
    fn connect_peers(&mut self, config: &NodeConfig) {
        let address = self.devices[0].module.address();
        for (handle, peer) in config.peers.iter().enumerate() {
            let request = SerialConnectRequest {
                serial: peer.serial.clone(),
                key_id: config.key_id,
                key: None,
                target_node_id: peer.node_id,
                timeout_seconds: config.lease_seconds,
                request_handle: handle as u8,
                address_hint: None,
                force_mode: false,
            };
            let mut port = self.fabric.port(address);
            self.devices[0].module.serial_connect(request, &mut port);
        }
    }

    /// Ask every connected peer for its serial number
    fn poll_status(&mut self) {
        let own = self.local().node_id();
        let partners: Vec<NodeId> = self.connected.iter().copied().collect();
        for partner in partners {
            self.next_request = self.next_request.wrapping_add(1);
            let request = Packet::new(
                own,
                partner,
                ModuleAction {
                    response: false,
                    module_id: STATUS_MODULE_ID,
                    request_handle: self.next_request,
                    action_type: ACTION_GET_DEVICE_INFO,
                    payload: Bytes::new(),
                },
            )
            .encode();
            if let Err(e) = self.devices[0]
                .module
                .send_packet(DeliveryPriority::Medium, &request)
            {
                warn!("Status request to {} not sent: {}", partner, e);
            }
        }
    }

    /// Advance every device by `ticks`
    fn step(&mut self, ticks: u32) {
        for event in self.fabric.poll() {
            let node = match &event {
                FabricEvent::LinkUp { node, .. }
                | FabricEvent::LinkDown { node, .. }
                | FabricEvent::Data { node, .. } => *node,
            };
            let Some(idx) = self.devices.iter().position(|d| d.module.address() == node) else {
                debug!("Fabric event for unknown device {}", node);
                continue;
            };
            let mut port = self.fabric.port(node);
            let module = &mut self.devices[idx].module;
            let outputs = match event {
                FabricEvent::LinkUp {
                    link,
                    peer,
                    incoming,
                    ..
                } => {
                    module.on_link_connected(link, peer, incoming, &mut port);
                    Vec::new()
                }
                FabricEvent::LinkDown { link, .. } => {
                    module.on_link_disconnected(link);
                    Vec::new()
                }
                FabricEvent::Data { link, data, .. } => module.on_raw_received(link, &data, &mut port),
            };
            for output in outputs {
                match output {
                    MeshOutput::DeliverLocal(packet) => self.deliver_local(idx, &packet),
                    MeshOutput::ForwardToMesh(packet) => {
                        debug!("Device {} has no mesh to forward {} bytes into", idx, packet.len())
                    }
                }
            }
        }

        for idx in 0..self.devices.len() {
            let address = self.devices[idx].module.address();
            let mut port = self.fabric.port(address);
            let device = &mut self.devices[idx];
            device.module.on_tick(ticks, &mut port);
            let mut events = Vec::new();
            while let Ok(event) = device.events.try_recv() {
                events.push(event);
            }
            if idx == 0 {
                for event in &events {
                    self.track(event);
                }
            }
        }
    }

    fn track(&mut self, event: &MeshAccessEvent) {
        match event {
            MeshAccessEvent::ConnState(state) if state.state == 4 => {
                self.connected.insert(state.partner_id);
            }
            MeshAccessEvent::ConnState(state) if state.state == 0 => {
                self.connected.remove(&state.partner_id);
            }
            MeshAccessEvent::SerialConnect(response) if response.code != SerialConnectCode::Success as u8 => {
                let serial = self
                    .peers
                    .get(response.request_handle as usize)
                    .map_or("?", |p| p.serial.as_str());
                component_warn!("serial", "Serial connect to {} failed with code {}", serial, response.code);
            }
            _ => {}
        }
    }

    fn deliver_local(&mut self, idx: usize, packet: &[u8]) {
        let Ok(action) = Packet::<ModuleAction>::decode(packet) else {
            debug!("Device {} got a packet that is no module action", idx);
            return;
        };
        if action.body.module_id != STATUS_MODULE_ID || action.body.action_type != ACTION_GET_DEVICE_INFO {
            return;
        }
        if action.body.response {
            let serial = String::from_utf8_lossy(&action.body.payload).into_owned();
            component_info!("status", "Node {} reports serial {}", action.header.sender, serial);
            if idx == 0 {
                self.statuses.push((action.header.sender, serial));
            }
            return;
        }

        let device = &mut self.devices[idx];
        let response = Packet::new(
            device.module.node_id(),
            action.header.sender,
            ModuleAction {
                response: true,
                module_id: STATUS_MODULE_ID,
                request_handle: action.body.request_handle,
                action_type: ACTION_GET_DEVICE_INFO,
                payload: Bytes::from(device.serial.clone()),
            },
        )
        .encode();
        if let Err(e) = device.module.send_packet(DeliveryPriority::Medium, &response) {
            warn!("Status response from {} not sent: {}", device.module.node_id(), e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "meshaccess_node",
        "mesh_module",
        "mesh_session",
        "mesh_queue",
        "mesh_timesync",
        "mesh_wire",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(MeshLogFormatter::new("meshaccess"))
        .init();

    info!("Starting mesh access node v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    if let Some(node_id) = args.node_id {
        config.mesh.node_id = node_id;
    }
    if config.peers.iter().any(|p| p.node_id == config.mesh.node_id) {
        anyhow::bail!("peer list contains the local node {}", config.mesh.node_id);
    }

    let mut deployment = Deployment::new(&config)?;
    deployment.connect_peers(&config);

    let tick_interval: Duration = args.tick_interval.into();
    let ticks = ticks_for(tick_interval);
    let mut tick = tokio::time::interval(tick_interval);
    let mut poll = tokio::time::interval(args.poll_interval.into());
    let run_for: Option<Duration> = args.run_for.map(Into::into);
    let deadline = async {
        match run_for {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    info!(
        "Node {} running with {} peers, {} ticks per step",
        config.mesh.node_id,
        config.peers.len(),
        ticks
    );

    loop {
        tokio::select! {
            _ = tick.tick() => deployment.step(ticks),
            _ = poll.tick() => deployment.poll_status(),
            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    info!(
        "Mesh access node stopped with {} open tunnels and {} status answers",
        deployment.connected.len(),
        deployment.statuses.len()
    );
    Ok(())
}
