//! Multi-node mesh access scenarios over the in-memory fabric.
//!
//! Nodes sharing a `group` form one mesh: a packet sent into the mesh is
//! seen by every other node of the group. Each node answers status
//! requests addressed to it with its serial number.

use bytes::Bytes;
use mesh_module::{
    ConnectRequest, DisconnectTarget, EventNotifier, FabricEvent, LinkFabric, MeshAccessConfig,
    MeshAccessEvent, MeshAccessModule, MeshOutput, ModuleError, NodeDirectory,
    SerialConnectRequest,
};
use mesh_queue::DeliveryPriority;
use mesh_session::{
    parse_key, ConnectionError, ConnectionHandle, ConnectionState, MeshInfo, USE_OWN_KEY,
};
use mesh_wire::{
    BleAddress, FmKeyId, MessageType, ModuleAction, NodeId, Packet, PacketHeader, TunnelType,
    NODE_ID_BROADCAST,
};
use tokio::sync::mpsc::UnboundedReceiver;

const STATUS_MODULE_ID: u8 = 3;
const ACTION_GET_DEVICE_INFO: u8 = 0x01;
const ACTION_PING: u8 = 0x02;
const TICKS_PER_DS: u32 = 3277;

struct SimNode {
    module: MeshAccessModule,
    events: UnboundedReceiver<MeshAccessEvent>,
    group: usize,
    serial: String,
    received: Vec<Packet<ModuleAction>>,
    log: Vec<String>,
}

struct Sim {
    fabric: LinkFabric,
    nodes: Vec<SimNode>,
}

fn address(node_id: NodeId) -> BleAddress {
    let [lo, hi] = node_id.to_le_bytes();
    BleAddress([0, 0, 0, lo, hi, 0])
}

fn hex_key(byte: u8) -> String {
    format!("{:02X}", byte).repeat(16)
}

fn node_config(node_id: NodeId, network_id: u16, serial: &str) -> MeshAccessConfig {
    MeshAccessConfig {
        node_id,
        network_id,
        serial: serial.to_string(),
        node_key: Some(hex_key(node_id as u8)),
        network_key: Some(hex_key(0x22)),
        organization_key: Some(hex_key(0x33)),
        ..MeshAccessConfig::default()
    }
}

impl Sim {
    fn new() -> Self {
        Self {
            fabric: LinkFabric::default(),
            nodes: Vec::new(),
        }
    }

    fn add_node(&mut self, config: MeshAccessConfig, group: usize, directory: NodeDirectory) -> usize {
        let addr = address(config.node_id);
        let serial = config.serial.clone();
        let (notifier, events) = EventNotifier::channel(config.node_id);
        let module = MeshAccessModule::new(config, addr, notifier, Box::new(directory)).unwrap();
        self.fabric.add_device(addr);
        self.nodes.push(SimNode {
            module,
            events,
            group,
            serial,
            received: Vec::new(),
            log: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn idx(&self, node_id: NodeId) -> usize {
        self.nodes
            .iter()
            .position(|n| n.module.node_id() == node_id)
            .unwrap()
    }

    fn node(&mut self, node_id: NodeId) -> &mut SimNode {
        let idx = self.idx(node_id);
        &mut self.nodes[idx]
    }

    /// Tell every node of each group who else is in it
    fn publish_groups(&mut self) {
        let groups: Vec<(usize, NodeId)> = self
            .nodes
            .iter()
            .map(|n| (n.group, n.module.node_id()))
            .collect();
        for node in self.nodes.iter_mut() {
            let members: Vec<NodeId> = groups
                .iter()
                .filter(|(g, _)| *g == node.group)
                .map(|(_, id)| *id)
                .collect();
            node.module.set_mesh_info(MeshInfo {
                cluster_size: members.len() as u16,
                hops_to_sink: -1,
                members,
            });
        }
    }

    fn connect(&mut self, from: NodeId, request: ConnectRequest) {
        self.try_connect(from, request).unwrap();
    }

    fn try_connect(
        &mut self,
        from: NodeId,
        request: ConnectRequest,
    ) -> Result<ConnectionHandle, ModuleError> {
        let idx = self.idx(from);
        let addr = self.nodes[idx].module.address();
        let mut port = self.fabric.port(addr);
        let result = self.nodes[idx].module.connect(request, &mut port);
        let node = &mut self.nodes[idx];
        while let Ok(event) = node.events.try_recv() {
            node.log.push(event.to_json());
        }
        result
    }

    fn serial_connect(&mut self, from: NodeId, request: SerialConnectRequest) {
        let idx = self.idx(from);
        let addr = self.nodes[idx].module.address();
        let mut port = self.fabric.port(addr);
        self.nodes[idx].module.serial_connect(request, &mut port);
    }

    fn disconnect(&mut self, from: NodeId, target: DisconnectTarget) {
        let idx = self.idx(from);
        let addr = self.nodes[idx].module.address();
        let mut port = self.fabric.port(addr);
        self.nodes[idx].module.disconnect(target, &mut port).unwrap();
    }

    /// One tenth of a second
    fn step(&mut self) {
        for event in self.fabric.poll() {
            let node = match &event {
                FabricEvent::LinkUp { node, .. }
                | FabricEvent::LinkDown { node, .. }
                | FabricEvent::Data { node, .. } => *node,
            };
            let Some(idx) = self.nodes.iter().position(|n| n.module.address() == node) else {
                continue;
            };
            let mut port = self.fabric.port(node);
            let outputs = match event {
                FabricEvent::LinkUp {
                    link,
                    peer,
                    incoming,
                    ..
                } => {
                    self.nodes[idx]
                        .module
                        .on_link_connected(link, peer, incoming, &mut port);
                    Vec::new()
                }
                FabricEvent::LinkDown { link, .. } => {
                    self.nodes[idx].module.on_link_disconnected(link);
                    Vec::new()
                }
                FabricEvent::Data { link, data, .. } => {
                    self.nodes[idx].module.on_raw_received(link, &data, &mut port)
                }
            };
            for output in outputs {
                match output {
                    MeshOutput::DeliverLocal(packet) => self.deliver_local(idx, packet),
                    MeshOutput::ForwardToMesh(packet) => self.into_mesh(idx, &packet),
                }
            }
        }
        for node in self.nodes.iter_mut() {
            let mut port = self.fabric.port(node.module.address());
            node.module.on_tick(TICKS_PER_DS, &mut port);
            while let Ok(event) = node.events.try_recv() {
                node.log.push(event.to_json());
            }
        }
    }

    fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Step until `pred` holds, at most `steps` times
    fn run_until(&mut self, steps: usize, mut pred: impl FnMut(&Sim) -> bool) -> bool {
        for _ in 0..steps {
            self.step();
            if pred(self) {
                return true;
            }
        }
        false
    }

    /// Packet originating at a node: into its tunnels and its mesh
    fn send_from(&mut self, idx: usize, packet: Bytes) {
        let _ = self.nodes[idx]
            .module
            .send_packet(DeliveryPriority::Medium, &packet);
        self.into_mesh(idx, &packet);
    }

    /// Packet that entered the mesh at a node reaches the other members
    fn into_mesh(&mut self, from: usize, packet: &Bytes) {
        let Ok(header) = PacketHeader::peek(packet) else {
            return;
        };
        let group = self.nodes[from].group;
        for idx in 0..self.nodes.len() {
            if idx == from || self.nodes[idx].group != group {
                continue;
            }
            let own = self.nodes[idx].module.node_id();
            if header.receiver == own || header.receiver == NODE_ID_BROADCAST {
                self.deliver_local(idx, packet.clone());
            }
            let _ = self.nodes[idx]
                .module
                .on_mesh_packet(DeliveryPriority::Medium, packet);
        }
    }

    fn deliver_local(&mut self, idx: usize, packet: Bytes) {
        let Ok(action) = Packet::<ModuleAction>::decode(&packet) else {
            return;
        };
        let answer = !action.body.response && action.body.module_id == STATUS_MODULE_ID;
        let node = &mut self.nodes[idx];
        node.received.push(action.clone());
        if answer && action.body.action_type == ACTION_GET_DEVICE_INFO {
            let response = Packet::new(
                node.module.node_id(),
                action.header.sender,
                ModuleAction {
                    response: true,
                    module_id: STATUS_MODULE_ID,
                    request_handle: action.body.request_handle,
                    action_type: ACTION_GET_DEVICE_INFO,
                    payload: Bytes::from(node.serial.clone()),
                },
            )
            .encode();
            self.send_from(idx, response);
        }
    }

    fn request(&mut self, from: NodeId, to: NodeId, action_type: u8, handle: u8) {
        let idx = self.idx(from);
        let packet = Packet::new(
            from,
            to,
            ModuleAction {
                response: false,
                module_id: STATUS_MODULE_ID,
                request_handle: handle,
                action_type,
                payload: Bytes::new(),
            },
        )
        .encode();
        self.send_from(idx, packet);
    }

    fn responses(&self, node_id: NodeId) -> Vec<(NodeId, String)> {
        let idx = self.idx(node_id);
        self.nodes[idx]
            .received
            .iter()
            .filter(|p| p.header.message_type == MessageType::ModuleActionResponse as u8)
            .map(|p| {
                (
                    p.header.sender,
                    String::from_utf8_lossy(&p.body.payload).into_owned(),
                )
            })
            .collect()
    }

    fn logged(&self, node_id: NodeId, line: &str) -> bool {
        let idx = self.idx(node_id);
        self.nodes[idx].log.iter().any(|l| l == line)
    }

    fn count_logged(&self, node_id: NodeId, line: &str) -> usize {
        let idx = self.idx(node_id);
        self.nodes[idx].log.iter().filter(|l| *l == line).count()
    }

    fn partner_of(&mut self, node_id: NodeId) -> NodeId {
        self.node(node_id)
            .module
            .connections()
            .next()
            .map(|c| c.partner_id())
            .unwrap()
    }
}

fn conn_state(node_id: NodeId, handle: u8, partner: NodeId, state: u8) -> String {
    format!(
        r#"{{"nodeId":{},"type":"ma_conn_state","module":10,"requestHandle":{},"partnerId":{},"state":{}}}"#,
        node_id, handle, partner, state
    )
}

fn serial_response(node_id: NodeId, handle: u8, code: u8, partner: NodeId) -> String {
    format!(
        r#"{{"type":"serial_connect_response","module":10,"nodeId":{},"requestHandle":{},"code":{},"partnerId":{}}}"#,
        node_id, handle, code, partner
    )
}

fn direct(to: NodeId, key_id: FmKeyId, key: Option<[u8; 16]>, tunnel_type: TunnelType) -> ConnectRequest {
    ConnectRequest {
        address: address(to),
        key_id,
        key,
        tunnel_type,
        request_handle: 0,
    }
}

/// Sink node 1 alone in network 10, nodes 2 and 3 in network 123
fn two_meshes() -> Sim {
    let mut sim = Sim::new();
    sim.add_node(node_config(1, 10, "BBBBB"), 0, NodeDirectory::new());
    sim.add_node(node_config(2, 123, "BBBBC"), 1, NodeDirectory::new());
    sim.add_node(node_config(3, 123, "BBBBD"), 1, NodeDirectory::new());
    sim.publish_groups();
    sim
}

#[test]
fn test_unsecure_connection_allowed_then_refused() {
    let mut sim = two_meshes();
    sim.node(1).module.set_allow_unsecure(true);
    sim.node(2).module.set_allow_unsecure(true);
    sim.node(1)
        .module
        .time_mut()
        .set_master_time(1_600_000_000, 0, 60, 0);

    sim.connect(1, direct(2, FmKeyId::Zero, None, TunnelType::PeerToPeer));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 4))));

    sim.request(1, 2000, ACTION_GET_DEVICE_INFO, 1);
    sim.run(10);
    assert_eq!(sim.responses(1), vec![(2000, "BBBBC".to_string())]);

    // The partner is in network 123 and takes the time across networks
    let tunnel = sim.node(1).module.connections().next().unwrap();
    assert_eq!(tunnel.partner_network_id(), Some(123));
    assert!(sim.node(2).module.time().is_time_synced());
    assert_eq!(sim.node(2).module.time().offset(), 60);

    sim.disconnect(1, DisconnectTarget::PartnerId(2000));
    sim.run(5);
    assert!(sim.logged(1, &conn_state(1, 0, 2000, 0)));

    sim.node(2).module.set_allow_unsecure(false);
    sim.node(1).log.clear();
    sim.connect(1, direct(2, FmKeyId::Zero, None, TunnelType::PeerToPeer));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 0))));
    assert!(!sim.logged(1, &conn_state(1, 0, 2000, 4)));

    sim.request(1, 2000, ACTION_GET_DEVICE_INFO, 2);
    sim.run(10);
    assert_eq!(sim.responses(1).len(), 1);

    // Both sides disabled: the initiator refuses before any link is opened
    sim.node(1).module.set_allow_unsecure(false);
    sim.node(1).log.clear();
    assert_eq!(
        sim.try_connect(1, direct(2, FmKeyId::Zero, None, TunnelType::PeerToPeer)),
        Err(ModuleError::Connection(ConnectionError::UnsecureNotAllowed))
    );
    assert_eq!(sim.node(1).log, vec![conn_state(1, 0, 2000, 0)]);
    sim.request(1, 2000, ACTION_GET_DEVICE_INFO, 3);
    assert!(!sim.run_until(100, |s| s.responses(1).len() > 1));
    assert_eq!(sim.node(1).module.connections().count(), 0);
    assert_eq!(sim.node(2).module.connections().count(), 0);
}

#[test]
fn test_restrained_key_connects_with_derived_key() {
    let mut sim = Sim::new();
    let mut sink = node_config(1, 10, "BBBBB");
    sink.node_key = Some("00112233445566778899AABBCCDDEEFF".to_string());
    sim.add_node(sink, 0, NodeDirectory::new());
    sim.add_node(node_config(3, 10, "BBBBD"), 0, NodeDirectory::new());
    sim.add_node(node_config(2, 123, "BBBBC"), 1, NodeDirectory::new());
    sim.publish_groups();

    let restrained = parse_key("2A:FC:35:99:4C:86:11:48:58:4C:C6:D9:EE:D4:A2:B6").unwrap();
    sim.connect(2, direct(1, FmKeyId::Restrained, Some(restrained), TunnelType::PeerToPeer));
    assert!(sim.run_until(50, |s| s.logged(2, &conn_state(2, 0, 2000, 4))));
    let accepted = sim.node(1).module.connections().next().unwrap();
    assert_eq!(accepted.key_id(), FmKeyId::Restrained);
    assert_eq!(accepted.partner_real_id(), Some(2));

    sim.request(2, 2000, ACTION_GET_DEVICE_INFO, 1);
    assert!(sim.run_until(20, |s| !s.responses(2).is_empty()));
    assert_eq!(sim.responses(2), vec![(2000, "BBBBB".to_string())]);

    // Broadcasts end at the partner
    sim.request(2, NODE_ID_BROADCAST, ACTION_PING, 2);
    sim.run(10);
    assert!(sim
        .node(1)
        .received
        .iter()
        .any(|p| p.body.action_type == ACTION_PING));
    assert!(sim.node(3).received.is_empty());
}

#[test]
fn test_restrained_key_mismatch_is_refused() {
    let mut sim = Sim::new();
    let mut sink = node_config(1, 10, "BBBBB");
    sink.node_key = Some("00112233445566778899AABBCCDDEEFF".to_string());
    sim.add_node(sink, 0, NodeDirectory::new());
    sim.add_node(node_config(2, 123, "BBBBC"), 1, NodeDirectory::new());
    sim.publish_groups();

    // The node key itself is not accepted for the restrained class
    let node_key = parse_key("00112233445566778899AABBCCDDEEFF").unwrap();
    sim.connect(2, direct(1, FmKeyId::Restrained, Some(node_key), TunnelType::PeerToPeer));
    assert!(sim.run_until(50, |s| s.logged(2, &conn_state(2, 0, 2000, 0))));
    assert!(!sim.logged(2, &conn_state(2, 0, 2000, 4)));
    assert_eq!(sim.node(1).module.connections().count(), 0);
}

#[test]
fn test_node_key_reaches_only_the_partner() {
    let mut sim = two_meshes();
    sim.connect(1, direct(2, FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 4))));
    let partner = sim.partner_of(1);
    assert_eq!(partner, 2000);

    sim.request(1, partner, ACTION_GET_DEVICE_INFO, 7);
    assert!(sim.run_until(20, |s| !s.responses(1).is_empty()));
    assert_eq!(sim.responses(1), vec![(partner, "BBBBC".to_string())]);

    // Node 3 has no virtual id on this tunnel; the request never leaves
    sim.request(1, 3, ACTION_GET_DEVICE_INFO, 8);
    sim.run(30);
    assert_eq!(sim.responses(1).len(), 1);
    assert!(sim.node(3).received.is_empty());

    // Broadcasts are delivered to the partner but not spread into its mesh
    sim.request(1, NODE_ID_BROADCAST, ACTION_PING, 9);
    sim.run(10);
    assert!(sim
        .node(2)
        .received
        .iter()
        .any(|p| p.body.action_type == ACTION_PING));
    assert!(sim.node(3).received.is_empty());
}

#[test]
fn test_node_key_remote_mesh_is_downgraded() {
    let mut sim = two_meshes();
    sim.connect(1, direct(2, FmKeyId::Node, Some([0x02; 16]), TunnelType::RemoteMesh));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 4))));
    let conn = sim.node(1).module.connections().next().unwrap();
    assert!(conn.is_downgraded());
    assert_eq!(conn.tunnel_type(), TunnelType::PeerToPeer);
    assert_eq!(conn.virtual_ids().len(), 1);
}

#[test]
fn test_wrong_node_key_reports_disconnected() {
    let mut sim = two_meshes();
    sim.connect(1, direct(2, FmKeyId::Node, Some([0x0F; 16]), TunnelType::RemoteMesh));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 0))));
    assert_eq!(sim.node(1).module.connections().count(), 0);
    assert_eq!(sim.node(2).module.connections().count(), 0);
}

#[test]
fn test_network_key_remote_mesh_reaches_other_nodes() {
    let mut sim = two_meshes();
    sim.connect(1, direct(2, FmKeyId::Network, Some(USE_OWN_KEY), TunnelType::RemoteMesh));
    assert!(sim.run_until(50, |s| s.logged(1, &conn_state(1, 0, 2000, 4))));
    sim.run(5);

    let remote_three = sim
        .node(1)
        .module
        .connections()
        .next()
        .and_then(|c| c.virtual_ids().to_virtual(3))
        .unwrap();
    sim.request(1, remote_three, ACTION_GET_DEVICE_INFO, 3);
    assert!(sim.run_until(20, |s| !s.responses(1).is_empty()));
    assert_eq!(sim.responses(1), vec![(remote_three, "BBBBD".to_string())]);

    // Broadcasts spread through the remote mesh
    sim.request(1, NODE_ID_BROADCAST, ACTION_PING, 4);
    sim.run(10);
    assert!(sim
        .node(3)
        .received
        .iter()
        .any(|p| p.body.action_type == ACTION_PING));
}

#[test]
fn test_serial_connect_is_idempotent_and_leased() {
    let mut sim = Sim::new();
    let mut directory = NodeDirectory::new();
    directory.insert("BBBBN", Some(4), address(4));
    sim.add_node(node_config(1, 10, "BBBBB"), 0, directory);
    sim.add_node(node_config(4, 10, "BBBBN"), 1, NodeDirectory::new());
    sim.publish_groups();

    let request = SerialConnectRequest {
        serial: "BBBBN".to_string(),
        key_id: FmKeyId::Network,
        key: Some(USE_OWN_KEY),
        target_node_id: 33010,
        timeout_seconds: 20,
        request_handle: 12,
        address_hint: None,
        force_mode: false,
    };
    let success = serial_response(1, 12, 0, 33010);

    sim.serial_connect(1, request.clone());
    assert!(sim.run_until(50, |s| s.logged(1, &success)));
    assert_eq!(sim.partner_of(1), 33010);

    sim.request(1, 33010, ACTION_GET_DEVICE_INFO, 5);
    assert!(sim.run_until(20, |s| !s.responses(1).is_empty()));
    assert_eq!(sim.responses(1), vec![(33010, "BBBBN".to_string())]);

    sim.serial_connect(1, request);
    sim.run(1);
    assert_eq!(sim.count_logged(1, &success), 2);
    assert_eq!(sim.node(1).module.connections().count(), 1);

    // Serial tunnels report request handle 0; 12 only answers the serial connect
    assert!(sim.logged(1, &conn_state(1, 0, 33010, ConnectionState::Connected as u8)));
    assert!(!sim.node(1).log.iter().any(|l| l.contains("ma_conn_state")
        && l.contains(r#""requestHandle":12"#)));

    let removed = conn_state(1, 0, 33010, ConnectionState::Disconnected as u8);
    assert!(sim.run_until(250, |s| s.logged(1, &removed)));
    assert_eq!(sim.node(1).module.connections().count(), 0);
}

#[test]
fn test_serial_connect_with_address_hint() {
    let mut sim = Sim::new();
    sim.add_node(node_config(2, 10, "BBBBC"), 0, NodeDirectory::new());
    let mut asset = node_config(33123, 10, "BBBBD");
    asset.organization_key = Some(hex_key(0x33));
    sim.add_node(asset, 1, NodeDirectory::new());

    sim.serial_connect(
        2,
        SerialConnectRequest {
            serial: "BBBBD".to_string(),
            key_id: FmKeyId::Organization,
            key: Some([0x33; 16]),
            target_node_id: 33123,
            timeout_seconds: 10,
            request_handle: 7,
            address_hint: Some(address(33123)),
            force_mode: true,
        },
    );
    assert!(sim.run_until(50, |s| s.logged(2, &serial_response(2, 7, 0, 33123))));

    sim.request(2, 33123, ACTION_GET_DEVICE_INFO, 1);
    assert!(sim.run_until(20, |s| !s.responses(2).is_empty()));
    assert_eq!(sim.responses(2), vec![(33123, "BBBBD".to_string())]);
}

#[test]
fn test_serial_connect_unknown_device_times_out() {
    let mut sim = Sim::new();
    sim.add_node(node_config(1, 10, "BBBBB"), 0, NodeDirectory::new());
    sim.serial_connect(
        1,
        SerialConnectRequest {
            serial: "BBBBZ".to_string(),
            key_id: FmKeyId::Network,
            key: None,
            target_node_id: 33011,
            timeout_seconds: 2,
            request_handle: 13,
            address_hint: None,
            force_mode: false,
        },
    );
    assert!(sim.run_until(30, |s| s.logged(1, &serial_response(1, 13, 1, 33011))));
    assert_eq!(sim.node(1).module.connections().count(), 0);
}
