//! Connection slots, serial connect leases and traffic routing of a node.

use bytes::Bytes;
use mesh_queue::DeliveryPriority;
use mesh_session::{
    virtual_id_base, ConnectParams, ConnectionContext, ConnectionError, ConnectionEvent,
    ConnectionHandle, ConnectionState, Delivery, DisconnectReason, LinkHandle, LinkTransport,
    MeshAccessConnection, MeshInfo, Role,
};
use mesh_timesync::{AppTimer, TimeContext, TimeManager, TimeSyncNotifier, TimeSyncedListener};
use mesh_wire::{
    BleAddress, MessageType, NodeId, Packet, PacketHeader, TunnelType, UpdateTimestamp,
    NODE_ID_BROADCAST,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::config::MeshAccessConfig;
use crate::directory::NodeResolver;
use crate::events::{EventNotifier, SerialConnectCode};
use crate::{
    ConnectRequest, DisconnectTarget, MeshOutput, ModuleError, SerialConnectRequest,
};

/// Set by the time manager when the clock changed
#[derive(Debug, Default)]
pub struct TimeSyncResetFlag(AtomicBool);

impl TimeSyncResetFlag {
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl TimeSyncNotifier for TimeSyncResetFlag {
    fn reset_time_sync(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    expires_ds: u32,
    request_handle: u8,
    answered: bool,
}

struct Slot {
    conn: MeshAccessConnection,
    pending_link: Option<LinkHandle>,
    lease: Option<Lease>,
}

#[derive(Debug, Clone)]
struct PendingSerialConnect {
    request: SerialConnectRequest,
    deadline_ds: u32,
}

/// Mesh access orchestration for one node
pub struct MeshAccessModule {
    config: MeshAccessConfig,
    ctx: Arc<ConnectionContext>,
    address: BleAddress,
    slots: Vec<Option<Slot>>,
    time: TimeManager,
    app_timer: Arc<AppTimer>,
    time_reset: Arc<TimeSyncResetFlag>,
    notifier: EventNotifier,
    directory: Box<dyn NodeResolver>,
    mesh: MeshInfo,
    pending_serial: Vec<PendingSerialConnect>,
}

impl MeshAccessModule {
    /// Module for the node at `address`
    pub fn new(
        config: MeshAccessConfig,
        address: BleAddress,
        notifier: EventNotifier,
        directory: Box<dyn NodeResolver>,
    ) -> Result<Self, ModuleError> {
        let ctx = Arc::new(config.connection_context()?);
        let app_timer = Arc::new(AppTimer::new());
        let time_reset = Arc::new(TimeSyncResetFlag::default());
        let time = TimeManager::new(TimeContext {
            node_id: config.node_id,
            device_type: config.device_type,
            notifier: time_reset.clone(),
            app_timer: app_timer.clone(),
        });
        let slots = (0..config.max_connections).map(|_| None).collect();
        info!(
            "Mesh access module for node {} at {} with {} slots",
            config.node_id, address, config.max_connections
        );
        Ok(Self {
            mesh: MeshInfo {
                cluster_size: 1,
                hops_to_sink: -1,
                members: vec![config.node_id],
            },
            config,
            ctx,
            address,
            slots,
            time,
            app_timer,
            time_reset,
            notifier,
            directory,
            pending_serial: Vec::new(),
        })
    }

    /// Own node id
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Own BLE address
    pub fn address(&self) -> BleAddress {
        self.address
    }

    /// Active configuration
    pub fn config(&self) -> &MeshAccessConfig {
        &self.config
    }

    /// Node clock
    pub fn time(&self) -> &TimeManager {
        &self.time
    }

    /// Node clock, mutable
    pub fn time_mut(&mut self) -> &mut TimeManager {
        &mut self.time
    }

    /// Register the time synced listener; a second one is refused
    pub fn add_time_synced_listener(
        &mut self,
        listener: Arc<dyn TimeSyncedListener>,
    ) -> Result<(), ModuleError> {
        Ok(self.time.add_time_synced_listener(listener)?)
    }

    /// Deciseconds since start
    pub fn now_ds(&self) -> u32 {
        self.app_timer.ds()
    }

    /// Local mesh as told to remote mesh partners
    pub fn mesh_info(&self) -> &MeshInfo {
        &self.mesh
    }

    /// Replace the local mesh description and tell remote mesh partners
    pub fn set_mesh_info(&mut self, mesh: MeshInfo) {
        self.mesh = mesh;
        for slot in self.slots.iter_mut().flatten() {
            if let Err(e) = slot.conn.update_cluster_info(&self.mesh) {
                warn!(
                    "Mesh access {} could not queue cluster info: {}",
                    slot.conn.handle(),
                    e
                );
            }
        }
    }

    /// Change the unsecure connection policy for tunnels created from now on
    pub fn set_allow_unsecure(&mut self, allow: bool) {
        self.config.allow_unenrolled_unsecure_connections = allow;
        Arc::make_mut(&mut self.ctx).allow_unsecure = allow;
    }

    /// Live connections
    pub fn connections(&self) -> impl Iterator<Item = &MeshAccessConnection> + '_ {
        self.slots.iter().flatten().map(|s| &s.conn)
    }

    /// Connection in a slot
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&MeshAccessConnection> {
        self.slots
            .get(handle.0 as usize)
            .and_then(|s| s.as_ref())
            .map(|s| &s.conn)
    }

    /// Connection whose partner has `partner_id`
    pub fn connection_by_partner(&self, partner_id: NodeId) -> Option<&MeshAccessConnection> {
        self.connections().find(|c| c.partner_id() == partner_id)
    }

    /// Open a tunnel to a BLE address. Repeating an identical request is
    /// answered from the existing tunnel.
    pub fn connect(
        &mut self,
        request: ConnectRequest,
        transport: &mut dyn LinkTransport,
    ) -> Result<ConnectionHandle, ModuleError> {
        let params = ConnectParams {
            address: request.address,
            key_id: request.key_id,
            key: request.key,
            tunnel_type: request.tunnel_type,
            request_handle: request.request_handle,
            partner_id: None,
            connect_timeout_ds: None,
        };
        self.open(params, None, transport)
    }

    fn open(
        &mut self,
        params: ConnectParams,
        lease: Option<Lease>,
        transport: &mut dyn LinkTransport,
    ) -> Result<ConnectionHandle, ModuleError> {
        let Some(resolved) = self.ctx.keys.resolve(params.key_id, params.key) else {
            return Err(self.refuse(&params, ConnectionError::KeyUnavailable(params.key_id)));
        };

        let existing = self.slots.iter_mut().flatten().find(|s| {
            s.conn.role() == Role::Initiator
                && s.conn.address() == params.address
                && s.conn.state() != ConnectionState::Disconnected
        });
        if let Some(slot) = existing {
            if !slot.conn.matches(&params, &resolved) {
                return Err(ModuleError::AlreadyConnected(params.address));
            }
            let connected = slot.conn.state() == ConnectionState::Connected;
            let partner = slot.conn.partner_id();
            debug!(
                "Mesh access {} already open to {}, reusing",
                slot.conn.handle(),
                params.address
            );
            match lease {
                Some(lease) => {
                    slot.lease = Some(Lease {
                        answered: connected,
                        ..lease
                    });
                    if connected {
                        self.notifier.serial_connect_response(
                            lease.request_handle,
                            SerialConnectCode::Success,
                            partner,
                        );
                    }
                }
                None if connected => self.notifier.conn_state(
                    params.request_handle,
                    partner,
                    ConnectionState::Connected as u8,
                ),
                None => {}
            }
            return Ok(slot.conn.handle());
        }

        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ModuleError::NoFreeSlot)?;
        let handle = ConnectionHandle(idx as u16);
        let conn =
            match MeshAccessConnection::new_outgoing(self.ctx.clone(), handle, &params, self.now_ds())
            {
                Ok(conn) => conn,
                Err(e) => return Err(self.refuse(&params, e)),
            };
        let link = transport.open_link(params.address)?;
        info!(
            "Mesh access {} connecting to {} with key {:?}, partner id {}",
            handle,
            params.address,
            params.key_id,
            conn.partner_id()
        );
        self.slots[idx] = Some(Slot {
            conn,
            pending_link: Some(link),
            lease,
        });
        Ok(handle)
    }

    /// A tunnel the local policy refused before it existed still reports
    /// a disconnected state for the requested partner
    fn refuse(&self, params: &ConnectParams, error: ConnectionError) -> ModuleError {
        let free = self.slots.iter().position(Option::is_none).unwrap_or(0);
        let partner = params
            .partner_id
            .unwrap_or_else(|| virtual_id_base(ConnectionHandle(free as u16)));
        warn!("Mesh access to {} refused locally: {}", params.address, error);
        self.notifier
            .conn_state(params.request_handle, partner, ConnectionState::Disconnected as u8);
        error.into()
    }

    /// Open a leased tunnel to a device known by serial number. The answer
    /// arrives as a `serial_connect_response` event.
    pub fn serial_connect(
        &mut self,
        request: SerialConnectRequest,
        transport: &mut dyn LinkTransport,
    ) {
        if let Some(address) = request.address_hint {
            info!("Doing instant serial_connect to BLE address {}", address);
            self.start_serial(&request, address, transport);
            return;
        }
        if let Some(address) = self.directory.address_for_serial(&request.serial) {
            self.start_serial(&request, address, transport);
            return;
        }
        debug!(
            "Serial {} not known yet, waiting up to {} s",
            request.serial, request.timeout_seconds
        );
        let deadline_ds = self.now_ds() + u32::from(request.timeout_seconds) * 10;
        self.pending_serial
            .retain(|p| p.request.serial != request.serial);
        self.pending_serial.push(PendingSerialConnect {
            request,
            deadline_ds,
        });
    }

    fn start_serial(
        &mut self,
        request: &SerialConnectRequest,
        address: BleAddress,
        transport: &mut dyn LinkTransport,
    ) {
        let params = ConnectParams {
            address,
            key_id: request.key_id,
            key: request.key,
            tunnel_type: TunnelType::PeerToPeer,
            // The serial handle is only answered in serial_connect_response
            request_handle: 0,
            partner_id: Some(request.target_node_id),
            connect_timeout_ds: request
                .force_mode
                .then_some(self.config.force_connect_timeout_ds),
        };
        let lease = Lease {
            expires_ds: self.now_ds() + u32::from(request.timeout_seconds) * 10,
            request_handle: request.request_handle,
            answered: false,
        };
        if let Err(e) = self.open(params, Some(lease), transport) {
            warn!("serial_connect to {} failed: {}", request.serial, e);
            let code = match e {
                ModuleError::NoFreeSlot => SerialConnectCode::NoFreeSlot,
                _ => SerialConnectCode::Rejected,
            };
            self.notifier
                .serial_connect_response(request.request_handle, code, request.target_node_id);
        }
    }

    /// Close a tunnel
    pub fn disconnect(
        &mut self,
        target: DisconnectTarget,
        transport: &mut dyn LinkTransport,
    ) -> Result<(), ModuleError> {
        let idx = self
            .slots
            .iter()
            .position(|s| {
                s.as_ref().map_or(false, |s| match target {
                    DisconnectTarget::PartnerId(id) => s.conn.partner_id() == id,
                    DisconnectTarget::Address(address) => s.conn.address() == address,
                    DisconnectTarget::Handle(handle) => s.conn.handle() == handle,
                })
            })
            .ok_or(ModuleError::NotFound)?;
        self.teardown(idx, DisconnectReason::Command, transport);
        Ok(())
    }

    /// Transport established a link
    pub fn on_link_connected(
        &mut self,
        link: LinkHandle,
        peer: BleAddress,
        incoming: bool,
        transport: &mut dyn LinkTransport,
    ) {
        let now = self.now_ds();
        let idx = if incoming {
            let Some(idx) = self.slots.iter().position(Option::is_none) else {
                warn!("No free mesh access slot for incoming link from {}", peer);
                transport.close_link(link);
                return;
            };
            let conn = MeshAccessConnection::new_incoming(
                self.ctx.clone(),
                ConnectionHandle(idx as u16),
                link,
                peer,
                now,
            );
            debug!("Mesh access {} accepting link from {}", conn.handle(), peer);
            self.slots[idx] = Some(Slot {
                conn,
                pending_link: None,
                lease: None,
            });
            idx
        } else {
            let Some(idx) = self.slots.iter().position(|s| {
                s.as_ref().map_or(false, |s| s.pending_link == Some(link))
            }) else {
                debug!("Closing unexpected link {} to {}", link, peer);
                transport.close_link(link);
                return;
            };
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.pending_link = None;
                slot.conn.on_link_connected(link, now);
            }
            idx
        };
        self.flush_slot(idx, transport);
    }

    /// Transport lost a link
    pub fn on_link_disconnected(&mut self, link: LinkHandle) {
        let now = self.now_ds();
        let Some(idx) = self.slot_by_link(link) else {
            return;
        };
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.pending_link = None;
            slot.conn.on_link_disconnected(now);
        }
        self.process_events(idx);
    }

    /// Raw chunk from a link. Returns the packets the node has to act on.
    pub fn on_raw_received(
        &mut self,
        link: LinkHandle,
        data: &[u8],
        transport: &mut dyn LinkTransport,
    ) -> Vec<MeshOutput> {
        let now = self.now_ds();
        let Some(idx) = self.slot_by_link(link) else {
            trace!("Chunk on unknown link {}", link);
            return Vec::new();
        };
        let result = match self.slots[idx].as_mut() {
            Some(slot) => slot.conn.on_raw_received(data, &self.mesh, now),
            None => return Vec::new(),
        };
        let outputs = self.process_events(idx);
        match result {
            Ok(()) => self.flush_slot(idx, transport),
            Err(e) => {
                warn!(
                    "Mesh access {} dropped: {}",
                    ConnectionHandle(idx as u16),
                    e
                );
                self.teardown(idx, e.disconnect_reason(), transport);
            }
        }
        outputs
    }

    /// Tick callback: advance clocks, expire timeouts and leases, resend
    /// time sync and move queued chunks to the links
    pub fn on_tick(&mut self, passed_ticks: u32, transport: &mut dyn LinkTransport) {
        self.app_timer.advance(passed_ticks);
        self.time.add_ticks(passed_ticks);
        self.time.process_ticks();
        let now = self.now_ds();

        self.process_pending_serial(now, transport);

        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_ref() else {
                continue;
            };
            let timeout = slot.conn.check_timeout(now);
            let expired = slot.lease.map_or(false, |l| now >= l.expires_ds);
            if let Some(reason) = timeout {
                self.teardown(idx, reason, transport);
            } else if expired {
                info!("Removing ma conn due to SCHEDULED_REMOVE");
                self.teardown(idx, DisconnectReason::ScheduledRemove, transport);
            }
        }

        if self.time_reset.take() {
            for slot in self.slots.iter_mut().flatten() {
                slot.conn.reset_time_sync();
            }
        }
        let now_ticks = self.app_timer.ticks();
        for slot in self.slots.iter_mut().flatten() {
            if let Err(e) = slot.conn.queue_time_sync(&mut self.time, now_ticks) {
                debug!(
                    "Mesh access {} could not queue time sync: {}",
                    slot.conn.handle(),
                    e
                );
            }
        }

        for idx in 0..self.slots.len() {
            self.flush_slot(idx, transport);
        }
    }

    /// Route a packet from the local node into every tunnel that carries it.
    /// Returns the number of tunnels it was queued on.
    pub fn send_packet(
        &mut self,
        priority: DeliveryPriority,
        packet: &[u8],
    ) -> Result<usize, ModuleError> {
        let mut routed = 0;
        let mut failure = None;
        for slot in self.slots.iter_mut().flatten() {
            match slot.conn.route_outbound(packet, priority) {
                Ok(true) => routed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Mesh access {} refused packet: {}", slot.conn.handle(), e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) if routed == 0 => Err(e.into()),
            _ => Ok(routed),
        }
    }

    /// Packet seen in the local mesh: timestamps for this node are applied,
    /// everything is offered to the tunnels
    pub fn on_mesh_packet(
        &mut self,
        priority: DeliveryPriority,
        packet: &[u8],
    ) -> Result<usize, ModuleError> {
        if let Ok(header) = PacketHeader::peek(packet) {
            let for_us = header.receiver == self.node_id() || header.receiver == NODE_ID_BROADCAST;
            if for_us {
                self.apply_timestamp(packet);
            }
        }
        self.send_packet(priority, packet)
    }

    fn apply_timestamp(&mut self, packet: &[u8]) -> bool {
        let is_timestamp = PacketHeader::peek(packet)
            .and_then(|h| h.kind())
            .map_or(false, |k| k == MessageType::UpdateTimestamp);
        if !is_timestamp {
            return false;
        }
        match Packet::<UpdateTimestamp>::decode(packet) {
            Ok(update) => {
                self.time.handle_update_timestamp(&update.body);
                true
            }
            Err(e) => {
                debug!("Ignoring malformed timestamp: {}", e);
                true
            }
        }
    }

    fn process_pending_serial(&mut self, now: u32, transport: &mut dyn LinkTransport) {
        if self.pending_serial.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_serial);
        for entry in pending {
            if let Some(address) = self.directory.address_for_serial(&entry.request.serial) {
                self.start_serial(&entry.request, address, transport);
            } else if now >= entry.deadline_ds {
                info!("serial_connect to {} timed out", entry.request.serial);
                self.notifier.serial_connect_response(
                    entry.request.request_handle,
                    SerialConnectCode::Timeout,
                    entry.request.target_node_id,
                );
            } else {
                self.pending_serial.push(entry);
            }
        }
    }

    fn slot_by_link(&self, link: LinkHandle) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref().map_or(false, |s| {
                s.conn.link() == Some(link) || s.pending_link == Some(link)
            })
        })
    }

    fn flush_slot(&mut self, idx: usize, transport: &mut dyn LinkTransport) {
        let now_ticks = self.app_timer.ticks();
        let result = match self.slots[idx].as_mut() {
            Some(slot) => slot.conn.fill_transmit(transport, now_ticks),
            None => return,
        };
        if let Err(e) = result {
            warn!(
                "Mesh access {} send failed: {}",
                ConnectionHandle(idx as u16),
                e
            );
            self.teardown(idx, e.disconnect_reason(), transport);
        }
    }

    fn teardown(&mut self, idx: usize, reason: DisconnectReason, transport: &mut dyn LinkTransport) {
        let now = self.now_ds();
        let Some(slot) = self.slots[idx].as_mut() else {
            return;
        };
        let link = slot.conn.disconnect(reason, now).or(slot.pending_link.take());
        if let Some(link) = link {
            transport.close_link(link);
        }
        self.process_events(idx);
    }

    fn process_events(&mut self, idx: usize) -> Vec<MeshOutput> {
        let events = match self.slots[idx].as_mut() {
            Some(slot) => slot.conn.drain_events(),
            None => return Vec::new(),
        };
        let mut outputs = Vec::new();
        for event in events {
            match event {
                ConnectionEvent::StateChanged(state) => self.report_state(idx, state),
                ConnectionEvent::Packet { packet, delivery } => {
                    self.deliver(packet, delivery, &mut outputs)
                }
                ConnectionEvent::TimeSync { sender, message } => {
                    if self.time.handle_time_sync(sender, &message) {
                        debug!("Adopted time from {}", sender);
                    }
                }
                ConnectionEvent::ClusterInfo {
                    cluster_size,
                    hops_to_sink,
                } => debug!(
                    "Mesh access {} partner mesh: {} nodes, {} hops to sink",
                    ConnectionHandle(idx as u16),
                    cluster_size,
                    hops_to_sink
                ),
            }
        }
        let closed = self.slots[idx]
            .as_ref()
            .map_or(false, |s| s.conn.state() == ConnectionState::Disconnected);
        if closed {
            self.slots[idx] = None;
        }
        outputs
    }

    fn report_state(&mut self, idx: usize, state: ConnectionState) {
        let Some(slot) = self.slots[idx].as_mut() else {
            return;
        };
        let partner = slot.conn.partner_id();
        self.notifier
            .conn_state(slot.conn.request_handle(), partner, state as u8);

        let Some(lease) = slot.lease.as_mut() else {
            return;
        };
        if lease.answered {
            return;
        }
        let code = match state {
            ConnectionState::Connected => SerialConnectCode::Success,
            _ => match slot.conn.disconnect_reason() {
                Some(DisconnectReason::ConnectTimeout)
                | Some(DisconnectReason::HandshakeTimeout)
                | Some(DisconnectReason::ScheduledRemove) => SerialConnectCode::Timeout,
                _ => SerialConnectCode::Rejected,
            },
        };
        lease.answered = true;
        self.notifier
            .serial_connect_response(lease.request_handle, code, partner);
    }

    fn deliver(&mut self, packet: Bytes, delivery: Delivery, outputs: &mut Vec<MeshOutput>) {
        if delivery.is_local() && !self.apply_timestamp(&packet) {
            outputs.push(MeshOutput::DeliverLocal(packet.clone()));
        }
        if delivery.reaches_mesh() {
            outputs.push(MeshOutput::ForwardToMesh(packet));
        }
    }
}
