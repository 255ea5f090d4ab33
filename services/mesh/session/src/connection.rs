//! Mesh access connection state machine.

use bytes::{Bytes, BytesMut};
use mesh_queue::{Chunk, ChunkedPriorityPacketQueue, DeliveryPriority, MessageHandle};
use mesh_timesync::TimeManager;
use mesh_wire::{
    open_packet, packet_nonce, seal_packet, BleAddress, ClusterInfoUpdate, DoneFlags,
    EncryptCustomANonce, EncryptCustomDone, EncryptCustomSNonce, EncryptCustomStart, FmKeyId,
    MessageType, NetworkId, NodeId, Packet, PacketHeader, Reassembler, SplitHeader,
    TimeSyncCorrection, TimeSyncMessage, TunnelType, WireError, MIC_SIZE, NODE_ID_BROADCAST,
    NODE_ID_GROUP_BASE, NODE_ID_VIRTUAL_BASE, SPLIT_HEADER_SIZE,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::handshake::{
    acceptor_proof, derive_session_key, generate_nonce, initiator_proof, proofs_match,
    HandshakeNonce, DIRECTION_FROM_ACCEPTOR, DIRECTION_FROM_INITIATOR, HANDSHAKE_VERSION,
};
use crate::keys::{Key, KeyStore};
use crate::scope::{AccessScope, Delivery};
use crate::transport::{LinkHandle, LinkTransport, SendResult};
use crate::virtual_ids::VirtualIdTable;
use crate::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionState, DisconnectReason,
    MeshInfo, Role, MAX_VIRTUAL_IDS_PER_TUNNEL,
};

/// Node settings shared by all connections of a node
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Local node id
    pub node_id: NodeId,
    /// Local network id
    pub network_id: NetworkId,
    /// Own keys
    pub keys: KeyStore,
    /// Accept and initiate ZERO key tunnels
    pub allow_unsecure: bool,
    /// Largest raw chunk the link carries
    pub link_mtu: usize,
    /// Largest reassembled packet
    pub max_packet_size: usize,
    /// Time allowed for the link to come up, deciseconds
    pub connect_timeout_ds: u32,
    /// Time allowed for the handshake, deciseconds
    pub handshake_timeout_ds: u32,
    /// Queue bytes per priority class
    pub queue_capacity_bytes: usize,
    /// Queued messages per priority class
    pub queue_max_messages: usize,
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self {
            node_id: 1,
            network_id: 1,
            keys: KeyStore::default(),
            allow_unsecure: false,
            link_mtu: 64,
            max_packet_size: 512,
            connect_timeout_ds: 100,
            handshake_timeout_ds: 100,
            queue_capacity_bytes: 2048,
            queue_max_messages: 16,
        }
    }
}

/// Request to open a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Partner BLE address
    pub address: BleAddress,
    /// Key class
    pub key_id: FmKeyId,
    /// Key value, `None` or [`USE_OWN_KEY`](crate::USE_OWN_KEY) for the own key
    pub key: Option<Key>,
    /// Requested tunnel type
    pub tunnel_type: TunnelType,
    /// Caller handle echoed in state events
    pub request_handle: u8,
    /// Virtual id the partner should get instead of an allocated one
    pub partner_id: Option<NodeId>,
    /// Link timeout replacing the node default, deciseconds
    pub connect_timeout_ds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    Idle,
    AwaitStart,
    AwaitANonce,
    AwaitSNonce,
    AwaitDone,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeSyncProgress {
    Idle,
    InitialQueued { handle: MessageHandle, queued_at: u64 },
    Sent,
}

/// One mesh access tunnel
pub struct MeshAccessConnection {
    ctx: Arc<ConnectionContext>,
    handle: ConnectionHandle,
    role: Role,
    state: ConnectionState,
    state_since_ds: u32,
    connect_timeout_ds: u32,
    address: BleAddress,
    link: Option<LinkHandle>,
    key_id: FmKeyId,
    key: Key,
    requested_tunnel_type: TunnelType,
    tunnel_type: TunnelType,
    downgraded: bool,
    request_handle: u8,
    step: HandshakeStep,
    anonce: HandshakeNonce,
    snonce: HandshakeNonce,
    session_key: Option<Key>,
    sealed: bool,
    tx_counter: u64,
    rx_counter: u64,
    partner_real_id: Option<NodeId>,
    partner_network_id: Option<NetworkId>,
    partner_cluster: Option<(u16, i16)>,
    outbox: VecDeque<Bytes>,
    queue: ChunkedPriorityPacketQueue,
    reassembler: Reassembler,
    virtual_ids: VirtualIdTable,
    time_sync: TimeSyncProgress,
    disconnect_reason: Option<DisconnectReason>,
    events: Vec<ConnectionEvent>,
}

/// First virtual id handed out by the connection in `handle`
pub fn virtual_id_base(handle: ConnectionHandle) -> NodeId {
    NODE_ID_VIRTUAL_BASE + handle.0 * MAX_VIRTUAL_IDS_PER_TUNNEL as NodeId
}

fn is_virtual_range(id: NodeId) -> bool {
    (NODE_ID_VIRTUAL_BASE..NODE_ID_GROUP_BASE).contains(&id)
}

fn granted_tunnel_type(key_id: FmKeyId, requested: TunnelType) -> TunnelType {
    if requested == TunnelType::RemoteMesh {
        key_id.max_tunnel_type()
    } else {
        requested
    }
}

impl MeshAccessConnection {
    fn blank(
        ctx: Arc<ConnectionContext>,
        handle: ConnectionHandle,
        role: Role,
        address: BleAddress,
        partner_id: Option<NodeId>,
        now_ds: u32,
    ) -> Self {
        let queue =
            ChunkedPriorityPacketQueue::new(ctx.queue_capacity_bytes, ctx.queue_max_messages);
        let reassembler = Reassembler::new(ctx.max_packet_size);
        Self {
            handle,
            role,
            state: ConnectionState::Disconnected,
            state_since_ds: now_ds,
            connect_timeout_ds: ctx.connect_timeout_ds,
            address,
            link: None,
            key_id: FmKeyId::Zero,
            key: [0; 16],
            requested_tunnel_type: TunnelType::PeerToPeer,
            tunnel_type: TunnelType::PeerToPeer,
            downgraded: false,
            request_handle: 0,
            step: HandshakeStep::Idle,
            anonce: [0; 8],
            snonce: [0; 8],
            session_key: None,
            sealed: false,
            tx_counter: 0,
            rx_counter: 0,
            partner_real_id: None,
            partner_network_id: None,
            partner_cluster: None,
            outbox: VecDeque::new(),
            queue,
            reassembler,
            virtual_ids: VirtualIdTable::new(
                virtual_id_base(handle),
                MAX_VIRTUAL_IDS_PER_TUNNEL,
                partner_id,
            ),
            time_sync: TimeSyncProgress::Idle,
            disconnect_reason: None,
            events: Vec::new(),
            ctx,
        }
    }

    /// Tunnel this node initiates. Fails if no key is known for the class or
    /// the class is not allowed here.
    pub fn new_outgoing(
        ctx: Arc<ConnectionContext>,
        handle: ConnectionHandle,
        params: &ConnectParams,
        now_ds: u32,
    ) -> Result<Self, ConnectionError> {
        if params.key_id == FmKeyId::Zero && !ctx.allow_unsecure {
            return Err(ConnectionError::UnsecureNotAllowed);
        }
        let key = ctx
            .keys
            .resolve(params.key_id, params.key)
            .ok_or(ConnectionError::KeyUnavailable(params.key_id))?;

        let tunnel_type = granted_tunnel_type(params.key_id, params.tunnel_type);
        let downgraded = tunnel_type != params.tunnel_type;
        if downgraded {
            warn!(
                "Using MeshAccessTunnelType::PEER_TO_PEER ({}) because FmKeyId ({}) does not allow others!",
                TunnelType::PeerToPeer as u8,
                params.key_id.as_u32()
            );
        }

        let mut conn = Self::blank(
            ctx,
            handle,
            Role::Initiator,
            params.address,
            params.partner_id,
            now_ds,
        );
        conn.state = ConnectionState::Connecting;
        conn.key_id = params.key_id;
        conn.key = key;
        conn.requested_tunnel_type = params.tunnel_type;
        conn.tunnel_type = tunnel_type;
        conn.downgraded = downgraded;
        conn.request_handle = params.request_handle;
        if let Some(timeout) = params.connect_timeout_ds {
            conn.connect_timeout_ds = timeout;
        }
        debug!(
            "Mesh access {} connecting to {} with key {:?}, tunnel {:?}",
            handle, params.address, params.key_id, tunnel_type
        );
        Ok(conn)
    }

    /// Tunnel a partner opened on `link`; waits for the handshake start
    pub fn new_incoming(
        ctx: Arc<ConnectionContext>,
        handle: ConnectionHandle,
        link: LinkHandle,
        address: BleAddress,
        now_ds: u32,
    ) -> Self {
        let mut conn = Self::blank(ctx, handle, Role::Acceptor, address, None, now_ds);
        conn.state = ConnectionState::Handshaking;
        conn.step = HandshakeStep::AwaitStart;
        conn.link = Some(link);
        conn
    }

    /// Slot of this connection
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Side of the tunnel
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Partner BLE address
    pub fn address(&self) -> BleAddress {
        self.address
    }

    /// Link carrying the tunnel
    pub fn link(&self) -> Option<LinkHandle> {
        self.link
    }

    /// Key class
    pub fn key_id(&self) -> FmKeyId {
        self.key_id
    }

    /// Tunnel type in effect
    pub fn tunnel_type(&self) -> TunnelType {
        self.tunnel_type
    }

    /// Requested tunnel type was reduced by the key class
    pub fn is_downgraded(&self) -> bool {
        self.downgraded
    }

    /// Caller handle of the connect request
    pub fn request_handle(&self) -> u8 {
        self.request_handle
    }

    /// Virtual id of the partner, known from creation on
    pub fn partner_id(&self) -> NodeId {
        self.virtual_ids.partner_id()
    }

    /// Partner's own node id, known after the handshake
    pub fn partner_real_id(&self) -> Option<NodeId> {
        self.partner_real_id
    }

    /// Partner's network id
    pub fn partner_network_id(&self) -> Option<NetworkId> {
        self.partner_network_id
    }

    /// Partner cluster size and hops to sink, once reported
    pub fn partner_cluster(&self) -> Option<(u16, i16)> {
        self.partner_cluster
    }

    /// Why the tunnel went down, once it did
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// Visibility scope of the tunnel
    pub fn scope(&self) -> AccessScope {
        AccessScope::new(self.key_id, self.tunnel_type)
    }

    /// Virtual id table
    pub fn virtual_ids(&self) -> &VirtualIdTable {
        &self.virtual_ids
    }

    /// Outbound queue
    pub fn queue(&self) -> &ChunkedPriorityPacketQueue {
        &self.queue
    }

    /// Whether an initiated tunnel was requested with exactly these
    /// parameters
    pub fn matches(&self, params: &ConnectParams, resolved_key: &Key) -> bool {
        self.role == Role::Initiator
            && self.address == params.address
            && self.key_id == params.key_id
            && &self.key == resolved_key
            && self.requested_tunnel_type == params.tunnel_type
            && params.partner_id.map_or(true, |id| id == self.partner_id())
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Link for an initiated tunnel came up; starts the handshake
    pub fn on_link_connected(&mut self, link: LinkHandle, now_ds: u32) {
        if self.role != Role::Initiator || self.state != ConnectionState::Connecting {
            return;
        }
        self.link = Some(link);
        self.set_state(ConnectionState::Handshaking, now_ds);
        self.step = HandshakeStep::AwaitANonce;
        let start = Packet::new(
            self.ctx.node_id,
            NODE_ID_BROADCAST,
            EncryptCustomStart {
                version: HANDSHAKE_VERSION,
                key_id: self.key_id,
                tunnel_type: self.tunnel_type,
                network_id: self.ctx.network_id,
            },
        );
        self.outbox.push_back(start.encode());
        debug!("Mesh access {} handshake started on {}", self.handle, link);
    }

    /// Timeout that applies in the current state, if it elapsed
    pub fn check_timeout(&self, now_ds: u32) -> Option<DisconnectReason> {
        let elapsed = now_ds.saturating_sub(self.state_since_ds);
        match self.state {
            ConnectionState::Connecting if elapsed > self.connect_timeout_ds => {
                Some(DisconnectReason::ConnectTimeout)
            }
            ConnectionState::Handshaking if elapsed > self.ctx.handshake_timeout_ds => {
                Some(DisconnectReason::HandshakeTimeout)
            }
            _ => None,
        }
    }

    /// Handle one raw chunk from the link. An error means the tunnel has to
    /// be torn down.
    pub fn on_raw_received(
        &mut self,
        data: &[u8],
        mesh: &MeshInfo,
        now_ds: u32,
    ) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Handshaking => self.handle_handshake(data, mesh, now_ds),
            ConnectionState::Connected => {
                let plain = if self.sealed {
                    let key = self.session_key.ok_or(ConnectionError::NotConnected)?;
                    let nonce = packet_nonce(self.rx_direction(), self.rx_counter);
                    let plain = open_packet(&key, &nonce, data)?;
                    self.rx_counter += 1;
                    plain
                } else {
                    Bytes::copy_from_slice(data)
                };
                match self.reassembler.add_chunk(&plain)? {
                    Some(packet) => self.handle_packet(packet),
                    None => Ok(()),
                }
            }
            state => {
                trace!(
                    "Mesh access {} ignoring {} bytes in state {:?}",
                    self.handle,
                    data.len(),
                    state
                );
                Ok(())
            }
        }
    }

    fn handle_handshake(
        &mut self,
        data: &[u8],
        mesh: &MeshInfo,
        now_ds: u32,
    ) -> Result<(), ConnectionError> {
        let header = PacketHeader::peek(data)?;
        let kind = header.kind()?;
        match (self.role, self.step, kind) {
            (Role::Acceptor, HandshakeStep::AwaitStart, MessageType::EncryptCustomStart) => {
                self.accept_start(Packet::decode(data)?)
            }
            (Role::Initiator, HandshakeStep::AwaitANonce, MessageType::EncryptCustomANonce) => {
                self.answer_anonce(Packet::decode(data)?)
            }
            (Role::Acceptor, HandshakeStep::AwaitSNonce, MessageType::EncryptCustomSNonce) => {
                self.verify_snonce(Packet::decode(data)?, mesh, now_ds)
            }
            (Role::Initiator, HandshakeStep::AwaitDone, MessageType::EncryptCustomDone) => {
                self.finish(Packet::decode(data)?, now_ds)
            }
            _ => Err(ConnectionError::UnexpectedMessage(
                header.message_type,
                self.state,
            )),
        }
    }

    fn accept_start(&mut self, packet: Packet<EncryptCustomStart>) -> Result<(), ConnectionError> {
        let start = packet.body;
        if start.key_id == FmKeyId::Zero && !self.ctx.allow_unsecure {
            warn!(
                "Refusing unsecure mesh access connection from {}",
                self.address
            );
            return Err(ConnectionError::UnsecureNotAllowed);
        }
        let key = self
            .ctx
            .keys
            .key_for(start.key_id)
            .ok_or(ConnectionError::KeyUnavailable(start.key_id))?;

        self.key_id = start.key_id;
        self.key = key;
        self.requested_tunnel_type = start.tunnel_type;
        self.tunnel_type = granted_tunnel_type(start.key_id, start.tunnel_type);
        self.downgraded = self.tunnel_type != start.tunnel_type;
        self.partner_real_id = Some(packet.header.sender);
        self.partner_network_id = Some(start.network_id);
        self.anonce = generate_nonce();
        self.step = HandshakeStep::AwaitSNonce;

        let reply = Packet::new(
            self.ctx.node_id,
            packet.header.sender,
            EncryptCustomANonce {
                anonce: self.anonce,
            },
        );
        self.outbox.push_back(reply.encode());
        debug!(
            "Mesh access {} accepting key {:?} from node {} of network {}",
            self.handle, start.key_id, packet.header.sender, start.network_id
        );
        Ok(())
    }

    fn answer_anonce(
        &mut self,
        packet: Packet<EncryptCustomANonce>,
    ) -> Result<(), ConnectionError> {
        self.anonce = packet.body.anonce;
        self.snonce = generate_nonce();
        let session_key = derive_session_key(&self.key, &self.anonce, &self.snonce)?;
        let proof = initiator_proof(&session_key, &self.anonce)?;
        self.session_key = Some(session_key);
        self.step = HandshakeStep::AwaitDone;

        let reply = Packet::new(
            self.ctx.node_id,
            packet.header.sender,
            EncryptCustomSNonce {
                snonce: self.snonce,
                proof,
            },
        );
        self.outbox.push_back(reply.encode());
        Ok(())
    }

    fn verify_snonce(
        &mut self,
        packet: Packet<EncryptCustomSNonce>,
        mesh: &MeshInfo,
        now_ds: u32,
    ) -> Result<(), ConnectionError> {
        self.snonce = packet.body.snonce;
        let session_key = derive_session_key(&self.key, &self.anonce, &self.snonce)?;
        let expected = initiator_proof(&session_key, &self.anonce)?;
        if !proofs_match(&expected, &packet.body.proof) {
            warn!(
                "Mesh access {} from {}: key mismatch for {:?}",
                self.handle, self.address, self.key_id
            );
            return Err(ConnectionError::HandshakeFailed("initiator proof mismatch"));
        }

        let mut flags = DoneFlags::empty();
        if self.tunnel_type == TunnelType::RemoteMesh {
            flags |= DoneFlags::REMOTE_MESH;
        }
        if self.key_id != FmKeyId::Zero {
            flags |= DoneFlags::SEALED;
        }
        let done = Packet::new(
            self.ctx.node_id,
            packet.header.sender,
            EncryptCustomDone {
                proof: acceptor_proof(&session_key, &self.snonce)?,
                flags,
                network_id: self.ctx.network_id,
                cluster_size: mesh.cluster_size,
                hops_to_sink: mesh.hops_to_sink,
            },
        );
        self.outbox.push_back(done.encode());
        self.session_key = Some(session_key);
        self.become_connected(now_ds);

        if self.scope().exposes_mesh() {
            self.send_cluster_info(mesh)?;
        }
        Ok(())
    }

    fn finish(
        &mut self,
        packet: Packet<EncryptCustomDone>,
        now_ds: u32,
    ) -> Result<(), ConnectionError> {
        let session_key = self.session_key.ok_or(ConnectionError::NotConnected)?;
        let expected = acceptor_proof(&session_key, &self.snonce)?;
        if !proofs_match(&expected, &packet.body.proof) {
            warn!(
                "Mesh access {} to {}: partner does not hold the {:?} key",
                self.handle, self.address, self.key_id
            );
            return Err(ConnectionError::HandshakeFailed("acceptor proof mismatch"));
        }
        let sealed = self.key_id != FmKeyId::Zero;
        if packet.body.flags.contains(DoneFlags::SEALED) != sealed {
            return Err(ConnectionError::HandshakeFailed("sealing mismatch"));
        }
        if !packet.body.flags.contains(DoneFlags::REMOTE_MESH)
            && self.tunnel_type == TunnelType::RemoteMesh
        {
            info!(
                "Mesh access {} partner granted PEER_TO_PEER only",
                self.handle
            );
            self.tunnel_type = TunnelType::PeerToPeer;
            self.downgraded = true;
        }

        self.partner_real_id = Some(packet.header.sender);
        self.partner_network_id = Some(packet.body.network_id);
        self.partner_cluster = Some((packet.body.cluster_size, packet.body.hops_to_sink));
        self.become_connected(now_ds);
        Ok(())
    }

    fn become_connected(&mut self, now_ds: u32) {
        self.sealed = self.key_id != FmKeyId::Zero;
        self.tx_counter = 0;
        self.rx_counter = 0;
        self.step = HandshakeStep::Done;
        self.time_sync = TimeSyncProgress::Idle;
        if let Some(real) = self.partner_real_id {
            self.virtual_ids.bind_partner(real);
        }
        self.set_state(ConnectionState::Connected, now_ds);
        info!(
            "Mesh access {} to {} connected: key {:?}, tunnel {:?}, partner {} (node {:?})",
            self.handle,
            self.address,
            self.key_id,
            self.tunnel_type,
            self.partner_id(),
            self.partner_real_id
        );
        self.events
            .push(ConnectionEvent::StateChanged(ConnectionState::Connected));
    }

    fn send_cluster_info(&mut self, mesh: &MeshInfo) -> Result<(), ConnectionError> {
        let Some(partner) = self.partner_real_id else {
            return Ok(());
        };
        let update = ClusterInfoUpdate {
            cluster_size: mesh.cluster_size,
            hops_to_sink: mesh.hops_to_sink,
            members: mesh.members.clone(),
        };
        let packet = Packet::new(self.ctx.node_id, partner, update).encode();
        self.enqueue(DeliveryPriority::High, packet)?;
        Ok(())
    }

    /// Send a fresh cluster info update to a remote mesh partner
    pub fn update_cluster_info(&mut self, mesh: &MeshInfo) -> Result<(), ConnectionError> {
        if self.role == Role::Acceptor
            && self.state == ConnectionState::Connected
            && self.scope().exposes_mesh()
        {
            self.send_cluster_info(mesh)?;
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Bytes) -> Result<(), ConnectionError> {
        let header = PacketHeader::peek(&packet)?;
        match header.kind() {
            Ok(MessageType::TimeSync) => {
                let sync = Packet::<TimeSyncMessage>::decode(&packet)?;
                self.events.push(ConnectionEvent::TimeSync {
                    sender: self.partner_id(),
                    message: sync.body,
                });
                Ok(())
            }
            Ok(MessageType::ClusterInfoUpdate) if self.role == Role::Initiator => {
                let info = Packet::<ClusterInfoUpdate>::decode(&packet)?;
                self.apply_cluster_info(info.body);
                Ok(())
            }
            Ok(kind)
                if kind.is_handshake()
                    || matches!(
                        kind,
                        MessageType::SplitWriteCmd | MessageType::SplitWriteCmdEnd
                    ) =>
            {
                Err(ConnectionError::UnexpectedMessage(kind as u8, self.state))
            }
            _ => self.route_inbound(packet, header),
        }
    }

    fn apply_cluster_info(&mut self, info: ClusterInfoUpdate) {
        self.partner_cluster = Some((info.cluster_size, info.hops_to_sink));
        if self.scope().exposes_mesh() {
            for member in info.members {
                if Some(member) == self.partner_real_id {
                    continue;
                }
                if self.virtual_ids.assign(member).is_err() {
                    warn!(
                        "Mesh access {} has no virtual id left for remote node {}",
                        self.handle, member
                    );
                    break;
                }
            }
        }
        self.events.push(ConnectionEvent::ClusterInfo {
            cluster_size: info.cluster_size,
            hops_to_sink: info.hops_to_sink,
        });
    }

    fn route_inbound(&mut self, packet: Bytes, header: PacketHeader) -> Result<(), ConnectionError> {
        let scope = self.scope();
        let sender = match self.role {
            Role::Acceptor => self.virtual_ids.assign(header.sender).ok(),
            Role::Initiator => match self.virtual_ids.to_virtual(header.sender) {
                Some(id) => Some(id),
                None if scope.exposes_mesh() => self.virtual_ids.assign(header.sender).ok(),
                None => None,
            },
        };
        let Some(sender) = sender else {
            trace!(
                "Mesh access {} dropping packet from unmapped node {}",
                self.handle,
                header.sender
            );
            return Ok(());
        };

        let own = self.ctx.node_id;
        let delivery = match self.role {
            Role::Acceptor => scope.inbound(header.receiver, own),
            Role::Initiator if header.receiver == own => Delivery::Local,
            Role::Initiator if header.receiver == NODE_ID_BROADCAST => Delivery::LocalAndMesh,
            Role::Initiator => Delivery::Mesh,
        };
        if delivery == Delivery::Drop {
            trace!(
                "Mesh access {} dropping out of scope packet {} -> {} ({:?})",
                self.handle,
                header.sender,
                header.receiver,
                self.key_id
            );
            return Ok(());
        }

        let mut buf = BytesMut::from(&packet[..]);
        PacketHeader::rewrite_sender(&mut buf, sender)?;
        self.events.push(ConnectionEvent::Packet {
            packet: buf.freeze(),
            delivery,
        });
        Ok(())
    }

    /// Queue a packet from the local side if this tunnel carries it. The
    /// receiver is restored from its virtual id. Returns whether it was
    /// queued.
    pub fn route_outbound(
        &mut self,
        packet: &[u8],
        priority: DeliveryPriority,
    ) -> Result<bool, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Ok(false);
        }
        let header = PacketHeader::peek(packet)?;
        if self.virtual_ids.contains_virtual(header.sender) || is_virtual_range(header.sender) {
            return Ok(false);
        }
        let own = self.ctx.node_id;
        let sender_visible = match self.role {
            Role::Acceptor => self.scope().exposes_sender(header.sender, own),
            Role::Initiator => true,
        };

        let receiver = if header.receiver == NODE_ID_BROADCAST {
            let allowed = match self.role {
                Role::Acceptor => sender_visible,
                Role::Initiator => header.sender == own,
            };
            if !allowed {
                return Ok(false);
            }
            NODE_ID_BROADCAST
        } else if let Some(real) = self.virtual_ids.to_real(header.receiver) {
            if !sender_visible {
                trace!(
                    "Mesh access {} not exposing node {} to the partner",
                    self.handle,
                    header.sender
                );
                return Ok(false);
            }
            real
        } else {
            return Ok(false);
        };

        let mut buf = BytesMut::from(packet);
        PacketHeader::rewrite_receiver(&mut buf, receiver)?;
        self.enqueue(priority, buf.freeze())?;
        Ok(true)
    }

    /// Queue an encoded packet as is
    pub fn enqueue(
        &mut self,
        priority: DeliveryPriority,
        packet: Bytes,
    ) -> Result<MessageHandle, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        if packet.len() > self.ctx.max_packet_size {
            return Err(WireError::Size(packet.len()).into());
        }
        let split = self.split_size(packet.len());
        Ok(self.queue.split_and_add_message(priority, packet, split)?)
    }

    fn split_size(&self, len: usize) -> usize {
        let mic = if self.sealed { MIC_SIZE } else { 0 };
        let room = self.ctx.link_mtu.saturating_sub(mic);
        if len <= room {
            len
        } else {
            room.saturating_sub(SPLIT_HEADER_SIZE).max(1)
        }
    }

    /// Cancel a queued packet none of whose chunks went out
    pub fn cancel(&mut self, handle: MessageHandle) -> Result<bool, ConnectionError> {
        Ok(self.queue.cancel(handle)?)
    }

    /// Move as many chunks to the link as it takes. A busy link rolls the
    /// peeked chunk back; a failed link is an error.
    pub fn fill_transmit(
        &mut self,
        transport: &mut dyn LinkTransport,
        now_ticks: u64,
    ) -> Result<usize, ConnectionError> {
        let Some(link) = self.link else {
            return Ok(0);
        };
        let mut sent = 0;
        while let Some(raw) = self.outbox.front() {
            match transport.send(link, raw) {
                SendResult::Success => {
                    self.outbox.pop_front();
                    sent += 1;
                }
                SendResult::Busy => return Ok(sent),
                SendResult::Failed => return Err(ConnectionError::LinkFailed),
            }
        }
        if self.state != ConnectionState::Connected {
            return Ok(sent);
        }

        while let Some(chunk) = self.queue.peek_next()? {
            let wire = match self.encode_chunk(&chunk) {
                Ok(wire) => wire,
                Err(e) => {
                    self.queue.rollback_look_ahead()?;
                    return Err(e);
                }
            };
            match transport.send(link, &wire) {
                SendResult::Success => {
                    if self.sealed {
                        self.tx_counter += 1;
                    }
                    sent += 1;
                    if let Some(done) = self.queue.commit()? {
                        self.on_message_sent(done, now_ticks);
                    }
                }
                SendResult::Busy => {
                    self.queue.rollback_look_ahead()?;
                    break;
                }
                SendResult::Failed => {
                    self.queue.rollback_look_ahead()?;
                    return Err(ConnectionError::LinkFailed);
                }
            }
        }
        Ok(sent)
    }

    fn encode_chunk(&self, chunk: &Chunk) -> Result<Bytes, ConnectionError> {
        let mut buf = BytesMut::with_capacity(chunk.payload.len() + SPLIT_HEADER_SIZE + MIC_SIZE);
        if chunk.is_split {
            SplitHeader {
                priority: chunk.priority as u8,
                counter: chunk.index,
                is_final: chunk.is_final,
            }
            .encode(&mut buf);
        }
        buf.extend_from_slice(&chunk.payload);
        if !self.sealed {
            return Ok(buf.freeze());
        }
        let key = self.session_key.ok_or(ConnectionError::NotConnected)?;
        let nonce = packet_nonce(self.tx_direction(), self.tx_counter);
        Ok(seal_packet(&key, &nonce, &buf)?)
    }

    fn on_message_sent(&mut self, handle: MessageHandle, now_ticks: u64) {
        let TimeSyncProgress::InitialQueued {
            handle: initial,
            queued_at,
        } = self.time_sync
        else {
            return;
        };
        if initial != handle {
            return;
        }
        self.time_sync = TimeSyncProgress::Sent;
        let Some(partner) = self.partner_real_id else {
            return;
        };
        let correction_ticks = now_ticks.saturating_sub(queued_at).min(u32::MAX as u64) as u32;
        let correction = Packet::new(
            self.ctx.node_id,
            partner,
            TimeSyncMessage::Correction(TimeSyncCorrection { correction_ticks }),
        )
        .encode();
        if let Err(e) = self.enqueue(DeliveryPriority::High, correction) {
            warn!(
                "Mesh access {} could not queue time correction: {}",
                self.handle, e
            );
        }
    }

    /// Whether the connection still has to announce the node's time
    pub fn needs_time_sync(&self) -> bool {
        self.state == ConnectionState::Connected && self.time_sync == TimeSyncProgress::Idle
    }

    /// Queue the node's time for the partner: initial message plus
    /// correction inside one network, a single inter network message across
    /// networks. Nothing happens while the local clock is not corrected.
    pub fn queue_time_sync(
        &mut self,
        time: &mut TimeManager,
        now_ticks: u64,
    ) -> Result<(), ConnectionError> {
        if !self.needs_time_sync() || !time.is_time_corrected() {
            return Ok(());
        }
        let Some(partner) = self.partner_real_id else {
            return Ok(());
        };
        if self.partner_network_id == Some(self.ctx.network_id) {
            let packet = time.time_sync_initial_message(partner).encode();
            let handle = self.enqueue(DeliveryPriority::High, packet)?;
            self.time_sync = TimeSyncProgress::InitialQueued {
                handle,
                queued_at: now_ticks,
            };
        } else {
            let packet = time.time_sync_inter_network_message(partner).encode();
            self.enqueue(DeliveryPriority::High, packet)?;
            self.time_sync = TimeSyncProgress::Sent;
        }
        debug!("Mesh access {} queued time sync for node {}", self.handle, partner);
        Ok(())
    }

    /// Clock changed; announce it again
    pub fn reset_time_sync(&mut self) {
        if let TimeSyncProgress::InitialQueued { handle, .. } = self.time_sync {
            if let Err(e) = self.queue.cancel(handle) {
                debug!(
                    "Mesh access {} could not drop queued time sync: {}",
                    self.handle, e
                );
            }
        }
        self.time_sync = TimeSyncProgress::Idle;
    }

    /// The link went away underneath the tunnel
    pub fn on_link_disconnected(&mut self, now_ds: u32) {
        self.link = None;
        self.disconnect(DisconnectReason::LinkLost, now_ds);
    }

    /// Tear the tunnel down: drop queued traffic, partial packets and
    /// virtual ids. Returns the link the owner still has to close.
    pub fn disconnect(&mut self, reason: DisconnectReason, now_ds: u32) -> Option<LinkHandle> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        info!(
            "Mesh access {} to {} disconnecting: {}",
            self.handle, self.address, reason
        );
        self.disconnect_reason = Some(reason);
        self.set_state(ConnectionState::Disconnecting, now_ds);
        self.queue.clear();
        self.reassembler.reset();
        self.outbox.clear();
        self.virtual_ids.clear();
        self.session_key = None;
        self.sealed = false;
        self.step = HandshakeStep::Idle;
        self.time_sync = TimeSyncProgress::Idle;
        self.set_state(ConnectionState::Disconnected, now_ds);
        self.events
            .push(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        self.link.take()
    }

    fn set_state(&mut self, state: ConnectionState, now_ds: u32) {
        trace!(
            "Mesh access {} state {:?} -> {:?}",
            self.handle,
            self.state,
            state
        );
        self.state = state;
        self.state_since_ds = now_ds;
    }

    fn tx_direction(&self) -> u8 {
        match self.role {
            Role::Initiator => DIRECTION_FROM_INITIATOR,
            Role::Acceptor => DIRECTION_FROM_ACCEPTOR,
        }
    }

    fn rx_direction(&self) -> u8 {
        match self.role {
            Role::Initiator => DIRECTION_FROM_ACCEPTOR,
            Role::Acceptor => DIRECTION_FROM_INITIATOR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ZERO_KEY, USE_OWN_KEY};
    use mesh_timesync::{AppTimer, DeviceType, TimeContext, TimeSyncNotifier};
    use mesh_wire::{ModuleAction, TimeSyncType};

    const ADDR_A: BleAddress = BleAddress([0, 0, 0, 1, 0, 0]);
    const ADDR_B: BleAddress = BleAddress([0, 0, 0, 2, 0, 0]);

    #[derive(Default)]
    struct TestLink {
        sent: Vec<Bytes>,
        busy: bool,
        failed: bool,
    }

    impl LinkTransport for TestLink {
        fn open_link(
            &mut self,
            _address: BleAddress,
        ) -> Result<LinkHandle, crate::TransportError> {
            Ok(LinkHandle(1))
        }

        fn send(&mut self, _link: LinkHandle, data: &[u8]) -> SendResult {
            if self.failed {
                SendResult::Failed
            } else if self.busy {
                SendResult::Busy
            } else {
                self.sent.push(Bytes::copy_from_slice(data));
                SendResult::Success
            }
        }

        fn close_link(&mut self, _link: LinkHandle) {}
    }

    #[derive(Debug, Default)]
    struct NoopNotifier;

    impl TimeSyncNotifier for NoopNotifier {
        fn reset_time_sync(&self) {}
    }

    fn ctx(node_id: NodeId, network_id: NetworkId, node_key: u8) -> Arc<ConnectionContext> {
        Arc::new(ConnectionContext {
            node_id,
            network_id,
            keys: KeyStore {
                node_key: Some([node_key; 16]),
                network_key: Some([network_id as u8; 16]),
                organization_key: None,
            },
            allow_unsecure: true,
            link_mtu: 32,
            ..ConnectionContext::default()
        })
    }

    fn params(key_id: FmKeyId, key: Option<Key>, tunnel_type: TunnelType) -> ConnectParams {
        ConnectParams {
            address: ADDR_B,
            key_id,
            key,
            tunnel_type,
            request_handle: 7,
            partner_id: None,
            connect_timeout_ds: None,
        }
    }

    struct Pair {
        a: MeshAccessConnection,
        b: MeshAccessConnection,
        a_link: TestLink,
        b_link: TestLink,
        mesh_b: MeshInfo,
    }

    impl Pair {
        fn new(a_ctx: Arc<ConnectionContext>, b_ctx: Arc<ConnectionContext>, p: &ConnectParams) -> Self {
            let mut a = MeshAccessConnection::new_outgoing(a_ctx, ConnectionHandle(0), p, 0).unwrap();
            let b = MeshAccessConnection::new_incoming(b_ctx, ConnectionHandle(1), LinkHandle(9), ADDR_A, 0);
            a.on_link_connected(LinkHandle(1), 0);
            Self {
                a,
                b,
                a_link: TestLink::default(),
                b_link: TestLink::default(),
                mesh_b: MeshInfo {
                    cluster_size: 2,
                    hops_to_sink: -1,
                    members: vec![2, 3],
                },
            }
        }

        /// Exchange chunks until both sides are quiet; first error wins
        fn pump(&mut self) -> Result<(), ConnectionError> {
            for _ in 0..64 {
                self.a.fill_transmit(&mut self.a_link, 0)?;
                self.b.fill_transmit(&mut self.b_link, 0)?;
                let to_b: Vec<Bytes> = self.a_link.sent.drain(..).collect();
                let to_a: Vec<Bytes> = self.b_link.sent.drain(..).collect();
                if to_a.is_empty() && to_b.is_empty() {
                    return Ok(());
                }
                for raw in to_b {
                    self.b.on_raw_received(&raw, &self.mesh_b, 0)?;
                }
                for raw in to_a {
                    self.a.on_raw_received(&raw, &MeshInfo::default(), 0)?;
                }
            }
            Ok(())
        }
    }

    fn action(sender: NodeId, receiver: NodeId, payload: &[u8]) -> Bytes {
        Packet::new(
            sender,
            receiver,
            ModuleAction {
                response: false,
                module_id: 3,
                request_handle: 1,
                action_type: 0x0A,
                payload: Bytes::copy_from_slice(payload),
            },
        )
        .encode()
    }

    fn packets(events: Vec<ConnectionEvent>) -> Vec<(PacketHeader, Delivery)> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Packet { packet, delivery } => {
                    Some((PacketHeader::peek(&packet).unwrap(), delivery))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_node_key_handshake() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();

        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.b.state(), ConnectionState::Connected);
        assert_eq!(pair.a.partner_real_id(), Some(2));
        assert_eq!(pair.b.partner_real_id(), Some(1));
        assert_eq!(pair.a.partner_id(), 2000);
        assert_eq!(pair.b.partner_id(), 2008);
        assert_eq!(pair.a.partner_cluster(), Some((2, -1)));
        assert_eq!(
            pair.a.drain_events(),
            vec![ConnectionEvent::StateChanged(ConnectionState::Connected)]
        );
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let p = params(FmKeyId::Node, Some([0x05; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        let err = pair.pump().unwrap_err();
        assert_eq!(
            err,
            ConnectionError::HandshakeFailed("initiator proof mismatch")
        );
        assert_eq!(err.disconnect_reason(), DisconnectReason::HandshakeFailed);
        assert_ne!(pair.b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_zero_key_refused_when_not_allowed() {
        let strict = Arc::new(ConnectionContext {
            allow_unsecure: false,
            ..(*ctx(2, 20, 0x02)).clone()
        });
        let p = params(FmKeyId::Zero, None, TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), strict.clone(), &p);
        assert_eq!(pair.pump(), Err(ConnectionError::UnsecureNotAllowed));

        assert!(matches!(
            MeshAccessConnection::new_outgoing(strict, ConnectionHandle(0), &p, 0),
            Err(ConnectionError::UnsecureNotAllowed)
        ));
    }

    #[test]
    fn test_zero_key_unsealed_tunnel() {
        let p = params(FmKeyId::Zero, None, TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        assert_eq!(pair.a.state(), ConnectionState::Connected);
        assert_eq!(pair.a.key, ZERO_KEY);
        assert!(!pair.a.sealed);
    }

    #[test]
    fn test_missing_key_is_reported() {
        let p = params(FmKeyId::Organization, Some(USE_OWN_KEY), TunnelType::RemoteMesh);
        assert!(matches!(
            MeshAccessConnection::new_outgoing(ctx(1, 10, 1), ConnectionHandle(0), &p, 0),
            Err(ConnectionError::KeyUnavailable(FmKeyId::Organization))
        ));
    }

    #[test]
    fn test_node_key_remote_mesh_downgrade() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::RemoteMesh);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        assert!(pair.a.is_downgraded());
        assert_eq!(pair.a.tunnel_type(), TunnelType::PeerToPeer);
        assert!(pair.a.matches(&p, &[0x02; 16]));
        pair.pump().unwrap();
        assert_eq!(pair.b.tunnel_type(), TunnelType::PeerToPeer);
        assert!(pair.a.virtual_ids().len() == 1);
    }

    #[test]
    fn test_status_request_reaches_partner_only() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let partner = pair.a.partner_id();
        assert!(pair
            .a
            .route_outbound(&action(1, partner, b""), DeliveryPriority::Medium)
            .unwrap());
        assert!(!pair
            .a
            .route_outbound(&action(1, 3, b""), DeliveryPriority::Medium)
            .unwrap());
        pair.pump().unwrap();

        let received = packets(pair.b.drain_events());
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.receiver, 2);
        assert_eq!(received[0].0.sender, pair.b.partner_id());
        assert_eq!(received[0].1, Delivery::Local);

        // A forged packet to a non-partner node is dropped silently
        pair.a.enqueue(DeliveryPriority::Medium, action(1, 3, b"")).unwrap();
        pair.pump().unwrap();
        assert!(packets(pair.b.drain_events()).is_empty());
    }

    #[test]
    fn test_response_carries_partner_virtual_id() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.a.drain_events();

        let requester = pair.b.partner_id();
        assert!(pair
            .b
            .route_outbound(&action(2, requester, b"info"), DeliveryPriority::Medium)
            .unwrap());
        // Other mesh nodes are not exposed over a node key tunnel
        assert!(!pair
            .b
            .route_outbound(&action(3, requester, b"info"), DeliveryPriority::Medium)
            .unwrap());
        pair.pump().unwrap();

        let received = packets(pair.a.drain_events());
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.sender, pair.a.partner_id());
        assert_eq!(received[0].0.receiver, 1);
        assert_eq!(received[0].1, Delivery::Local);
    }

    #[test]
    fn test_remote_mesh_assigns_member_ids() {
        let p = params(FmKeyId::Network, Some(USE_OWN_KEY), TunnelType::RemoteMesh);
        let mut pair = Pair::new(ctx(1, 20, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();

        let events = pair.a.drain_events();
        assert!(events.contains(&ConnectionEvent::ClusterInfo {
            cluster_size: 2,
            hops_to_sink: -1
        }));
        let remote_three = pair.a.virtual_ids().to_virtual(3).unwrap();
        assert!(pair
            .a
            .route_outbound(&action(1, remote_three, b""), DeliveryPriority::Medium)
            .unwrap());
        pair.pump().unwrap();

        let received = packets(pair.b.drain_events());
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.receiver, 3);
        assert_eq!(received[0].1, Delivery::Mesh);
    }

    #[test]
    fn test_large_packet_is_split_sealed_and_reassembled() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let payload: Vec<u8> = (0..150u8).collect();
        let partner = pair.a.partner_id();
        pair.a
            .route_outbound(&action(1, partner, &payload), DeliveryPriority::Low)
            .unwrap();
        assert!(pair.a.queue().amount_of_packets() > 1);
        pair.a.fill_transmit(&mut pair.a_link, 0).unwrap();
        assert!(pair.a_link.sent.iter().all(|c| c.len() <= 32));
        pair.pump().unwrap();

        let received: Vec<Bytes> = pair
            .b
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::Packet { packet, .. } => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 1);
        let body = Packet::<ModuleAction>::decode(&received[0]).unwrap().body;
        assert_eq!(&body.payload[..], &payload[..]);
    }

    #[test]
    fn test_busy_link_rolls_back() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let partner = pair.a.partner_id();
        pair.a
            .route_outbound(&action(1, partner, b"x"), DeliveryPriority::Medium)
            .unwrap();
        pair.a_link.busy = true;
        assert_eq!(pair.a.fill_transmit(&mut pair.a_link, 0).unwrap(), 0);
        assert_eq!(pair.a.queue().amount_of_packets(), 1);

        pair.a_link.busy = false;
        pair.pump().unwrap();
        assert_eq!(packets(pair.b.drain_events()).len(), 1);

        pair.a
            .route_outbound(&action(1, partner, b"y"), DeliveryPriority::Medium)
            .unwrap();
        pair.a_link.failed = true;
        assert_eq!(
            pair.a.fill_transmit(&mut pair.a_link, 0),
            Err(ConnectionError::LinkFailed)
        );
    }

    #[test]
    fn test_tampered_chunk_is_violation() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();

        let partner = pair.a.partner_id();
        pair.a
            .route_outbound(&action(1, partner, b"x"), DeliveryPriority::Medium)
            .unwrap();
        pair.a.fill_transmit(&mut pair.a_link, 0).unwrap();
        let mut raw = pair.a_link.sent.remove(0).to_vec();
        raw[0] ^= 0xFF;
        assert_eq!(
            pair.b.on_raw_received(&raw, &MeshInfo::default(), 0),
            Err(ConnectionError::Wire(WireError::Crypto))
        );
    }

    #[test]
    fn test_out_of_order_chunks_unsealed() {
        let p = params(FmKeyId::Zero, None, TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();

        let mut chunk = BytesMut::new();
        SplitHeader {
            priority: 2,
            counter: 1,
            is_final: true,
        }
        .encode(&mut chunk);
        chunk.extend_from_slice(b"tail");
        assert!(matches!(
            pair.b.on_raw_received(&chunk, &MeshInfo::default(), 0),
            Err(ConnectionError::Wire(WireError::Sequence { .. }))
        ));
    }

    #[test]
    fn test_time_sync_initial_then_correction() {
        let p = params(FmKeyId::Network, Some(USE_OWN_KEY), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 20, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let mut time = TimeManager::new(TimeContext {
            node_id: 1,
            device_type: DeviceType::Static,
            notifier: Arc::new(NoopNotifier),
            app_timer: Arc::new(AppTimer::new()),
        });
        assert!(pair.a.needs_time_sync());
        pair.a.queue_time_sync(&mut time, 0).unwrap();
        assert_eq!(pair.a.queue().amount_of_packets(), 0);

        time.set_master_time(1_000, 0, 0, 0);
        pair.a.queue_time_sync(&mut time, 100).unwrap();
        assert!(!pair.a.needs_time_sync());
        pair.a.fill_transmit(&mut pair.a_link, 250).unwrap();
        pair.pump().unwrap();

        let syncs: Vec<TimeSyncMessage> = pair
            .b
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::TimeSync { message, .. } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(syncs.len(), 2);
        assert_eq!(syncs[0].sync_type(), TimeSyncType::Initial);
        assert_eq!(
            syncs[1],
            TimeSyncMessage::Correction(TimeSyncCorrection {
                correction_ticks: 150
            })
        );

        pair.a.reset_time_sync();
        assert!(pair.a.needs_time_sync());
    }

    #[test]
    fn test_time_reset_drops_unsent_initial_sync() {
        let p = params(FmKeyId::Network, Some(USE_OWN_KEY), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 20, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let mut time = TimeManager::new(TimeContext {
            node_id: 1,
            device_type: DeviceType::Static,
            notifier: Arc::new(NoopNotifier),
            app_timer: Arc::new(AppTimer::new()),
        });
        time.set_master_time(1_000, 0, 0, 0);
        pair.a.queue_time_sync(&mut time, 0).unwrap();
        assert_eq!(pair.a.queue().amount_of_packets(), 1);

        pair.a.reset_time_sync();
        assert_eq!(pair.a.queue().amount_of_packets(), 0);
        assert!(pair.a.needs_time_sync());

        // Resetting again with nothing queued is harmless
        pair.a.reset_time_sync();
        assert!(pair.a.needs_time_sync());
    }

    #[test]
    fn test_foreign_network_gets_inter_network_sync() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.b.drain_events();

        let mut time = TimeManager::new(TimeContext {
            node_id: 1,
            device_type: DeviceType::Static,
            notifier: Arc::new(NoopNotifier),
            app_timer: Arc::new(AppTimer::new()),
        });
        time.set_master_time(1_000, 0, 0, 0);
        pair.a.queue_time_sync(&mut time, 0).unwrap();
        pair.pump().unwrap();
        let events = pair.b.drain_events();
        assert!(matches!(
            events.as_slice(),
            [ConnectionEvent::TimeSync {
                message: TimeSyncMessage::InterNetwork(_),
                ..
            }]
        ));
    }

    #[test]
    fn test_disconnect_clears_state() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let mut pair = Pair::new(ctx(1, 10, 0x01), ctx(2, 20, 0x02), &p);
        pair.pump().unwrap();
        pair.a.drain_events();

        let partner = pair.a.partner_id();
        pair.a
            .route_outbound(&action(1, partner, b"x"), DeliveryPriority::Medium)
            .unwrap();
        assert_eq!(
            pair.a.disconnect(DisconnectReason::Command, 5),
            Some(LinkHandle(1))
        );
        assert_eq!(pair.a.state(), ConnectionState::Disconnected);
        assert_eq!(pair.a.disconnect_reason(), Some(DisconnectReason::Command));
        assert_eq!(pair.a.queue().amount_of_packets(), 0);
        assert!(pair.a.virtual_ids().is_empty());
        assert_eq!(pair.a.partner_id(), partner);
        assert_eq!(
            pair.a.drain_events(),
            vec![ConnectionEvent::StateChanged(ConnectionState::Disconnected)]
        );
        assert_eq!(pair.a.disconnect(DisconnectReason::Command, 6), None);
        assert!(pair.a.drain_events().is_empty());
    }

    #[test]
    fn test_timeouts() {
        let p = params(FmKeyId::Node, Some([0x02; 16]), TunnelType::PeerToPeer);
        let conn =
            MeshAccessConnection::new_outgoing(ctx(1, 10, 1), ConnectionHandle(0), &p, 0).unwrap();
        assert_eq!(conn.check_timeout(100), None);
        assert_eq!(conn.check_timeout(101), Some(DisconnectReason::ConnectTimeout));

        let forced = ConnectParams {
            connect_timeout_ds: Some(150),
            ..p
        };
        let conn = MeshAccessConnection::new_outgoing(ctx(1, 10, 1), ConnectionHandle(0), &forced, 0)
            .unwrap();
        assert_eq!(conn.check_timeout(101), None);
        assert_eq!(conn.check_timeout(151), Some(DisconnectReason::ConnectTimeout));

        let incoming = MeshAccessConnection::new_incoming(
            ctx(2, 20, 2),
            ConnectionHandle(1),
            LinkHandle(3),
            ADDR_A,
            50,
        );
        assert_eq!(
            incoming.check_timeout(151),
            Some(DisconnectReason::HandshakeTimeout)
        );
    }
}
