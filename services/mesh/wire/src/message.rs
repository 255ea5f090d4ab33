//! Message bodies exchanged over mesh access links.
//!
//! Every body implements [`WireMessage`]; [`Packet`] glues a body to its
//! [`PacketHeader`]. All integers are little endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{FmKeyId, MessageType, NetworkId, NodeId, PacketHeader, TunnelType, WireError};

/// Handshake nonce length
pub const HANDSHAKE_NONCE_SIZE: usize = 8;

/// Handshake proof length (a full AES-GCM tag)
pub const HANDSHAKE_PROOF_SIZE: usize = 16;

/// Maximum members listed in one cluster info update
const MAX_CLUSTER_MEMBERS: usize = 64;

/// A message body with a fixed message type
pub trait WireMessage: Sized {
    /// Message type written into the header
    fn message_type(&self) -> MessageType;

    /// Append the body to `buf`
    fn encode_body(&self, buf: &mut BytesMut);

    /// Parse the body of a packet whose header carried `message_type`
    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError>;
}

fn need(buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.len() < len {
        Err(WireError::Incomplete)
    } else {
        Ok(())
    }
}

fn expect_type(got: MessageType, want: MessageType) -> Result<(), WireError> {
    if got == want {
        Ok(())
    } else {
        Err(WireError::Type(got as u8))
    }
}

/// Header plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<M> {
    /// Packet header
    pub header: PacketHeader,
    /// Message body
    pub body: M,
}

impl<M: WireMessage> Packet<M> {
    /// Wrap a body, deriving the header's message type from it
    pub fn new(sender: NodeId, receiver: NodeId, body: M) -> Self {
        Self {
            header: PacketHeader::new(body.message_type(), sender, receiver),
            body,
        }
    }

    /// Encode header and body
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        self.header.encode(&mut buf);
        self.body.encode_body(&mut buf);
        buf.freeze()
    }

    /// Decode a packet; trailing bytes are ignored
    pub fn decode(packet: &[u8]) -> Result<Self, WireError> {
        let mut buf = packet;
        let header = PacketHeader::decode(&mut buf)?;
        let body = M::decode_body(header.kind()?, &mut buf)?;
        Ok(Self { header, body })
    }
}

/// Time sync message variants
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSyncType {
    /// Full clock state with election counter
    Initial = 0,
    /// Ticks spent between creating and sending the initial message
    Correction = 1,
    /// Clock state crossing network boundaries
    InterNetwork = 2,
}

impl TryFrom<u8> for TimeSyncType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TimeSyncType::Initial),
            1 => Ok(TimeSyncType::Correction),
            2 => Ok(TimeSyncType::InterNetwork),
            _ => Err(WireError::Code(value as u32)),
        }
    }
}

/// Clock state sent to a partner of the same network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSyncInitial {
    /// Unix seconds at the last sync
    pub sync_time_stamp: u32,
    /// Whole seconds elapsed since then
    pub time_since_sync_time_stamp: u32,
    /// Sub-second ticks
    pub additional_ticks: u32,
    /// Local time offset in minutes
    pub offset: i16,
    /// Sync generation
    pub counter: u32,
    /// Sender's application timer in deciseconds
    pub app_timer_ds: u32,
}

/// Correction following a [`TimeSyncInitial`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSyncCorrection {
    /// Ticks to add to the clock
    pub correction_ticks: u32,
}

/// Clock state sent to a partner of a foreign network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeSyncInterNetwork {
    /// Unix seconds at the last sync
    pub sync_time_stamp: u32,
    /// Whole seconds elapsed since then
    pub time_since_sync_time_stamp: u32,
    /// Sub-second ticks
    pub additional_ticks: u32,
    /// Local time offset in minutes
    pub offset: i16,
}

/// Body of a [`MessageType::TimeSync`] packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncMessage {
    /// Full clock state
    Initial(TimeSyncInitial),
    /// Tick correction
    Correction(TimeSyncCorrection),
    /// Inter network clock state
    InterNetwork(TimeSyncInterNetwork),
}

impl TimeSyncMessage {
    /// Variant tag
    pub fn sync_type(&self) -> TimeSyncType {
        match self {
            TimeSyncMessage::Initial(_) => TimeSyncType::Initial,
            TimeSyncMessage::Correction(_) => TimeSyncType::Correction,
            TimeSyncMessage::InterNetwork(_) => TimeSyncType::InterNetwork,
        }
    }
}

impl WireMessage for TimeSyncMessage {
    fn message_type(&self) -> MessageType {
        MessageType::TimeSync
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sync_type() as u8);
        match self {
            TimeSyncMessage::Initial(m) => {
                buf.put_u32_le(m.sync_time_stamp);
                buf.put_u32_le(m.time_since_sync_time_stamp);
                buf.put_u32_le(m.additional_ticks);
                buf.put_i16_le(m.offset);
                buf.put_u32_le(m.counter);
                buf.put_u32_le(m.app_timer_ds);
            }
            TimeSyncMessage::Correction(m) => buf.put_u32_le(m.correction_ticks),
            TimeSyncMessage::InterNetwork(m) => {
                buf.put_u32_le(m.sync_time_stamp);
                buf.put_u32_le(m.time_since_sync_time_stamp);
                buf.put_u32_le(m.additional_ticks);
                buf.put_i16_le(m.offset);
            }
        }
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::TimeSync)?;
        need(buf, 1)?;
        match TimeSyncType::try_from(buf.get_u8())? {
            TimeSyncType::Initial => {
                need(buf, 22)?;
                Ok(TimeSyncMessage::Initial(TimeSyncInitial {
                    sync_time_stamp: buf.get_u32_le(),
                    time_since_sync_time_stamp: buf.get_u32_le(),
                    additional_ticks: buf.get_u32_le(),
                    offset: buf.get_i16_le(),
                    counter: buf.get_u32_le(),
                    app_timer_ds: buf.get_u32_le(),
                }))
            }
            TimeSyncType::Correction => {
                need(buf, 4)?;
                Ok(TimeSyncMessage::Correction(TimeSyncCorrection {
                    correction_ticks: buf.get_u32_le(),
                }))
            }
            TimeSyncType::InterNetwork => {
                need(buf, 14)?;
                Ok(TimeSyncMessage::InterNetwork(TimeSyncInterNetwork {
                    sync_time_stamp: buf.get_u32_le(),
                    time_since_sync_time_stamp: buf.get_u32_le(),
                    additional_ticks: buf.get_u32_le(),
                    offset: buf.get_i16_le(),
                }))
            }
        }
    }
}

/// Command setting the receiver's clock; the offset may be left off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTimestamp {
    /// Unix seconds
    pub timestamp_sec: u32,
    /// Local time offset in minutes
    pub offset: Option<i16>,
}

impl WireMessage for UpdateTimestamp {
    fn message_type(&self) -> MessageType {
        MessageType::UpdateTimestamp
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.timestamp_sec);
        if let Some(offset) = self.offset {
            buf.put_i16_le(offset);
        }
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::UpdateTimestamp)?;
        need(buf, 4)?;
        let timestamp_sec = buf.get_u32_le();
        let offset = if buf.remaining() >= 2 {
            Some(buf.get_i16_le())
        } else {
            None
        };
        Ok(Self {
            timestamp_sec,
            offset,
        })
    }
}

/// Size, sink distance and members of the sender's mesh
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterInfoUpdate {
    /// Number of nodes in the cluster
    pub cluster_size: u16,
    /// Hops to the nearest sink, -1 without a sink
    pub hops_to_sink: i16,
    /// Node ids reachable behind the sender
    pub members: Vec<NodeId>,
}

impl WireMessage for ClusterInfoUpdate {
    fn message_type(&self) -> MessageType {
        MessageType::ClusterInfoUpdate
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        let members = &self.members[..self.members.len().min(MAX_CLUSTER_MEMBERS)];
        buf.put_u16_le(self.cluster_size);
        buf.put_i16_le(self.hops_to_sink);
        buf.put_u8(members.len() as u8);
        for member in members {
            buf.put_u16_le(*member);
        }
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::ClusterInfoUpdate)?;
        need(buf, 5)?;
        let cluster_size = buf.get_u16_le();
        let hops_to_sink = buf.get_i16_le();
        let count = buf.get_u8() as usize;
        if count > MAX_CLUSTER_MEMBERS {
            return Err(WireError::Size(count));
        }
        need(buf, count * 2)?;
        let members = (0..count).map(|_| buf.get_u16_le()).collect();
        Ok(Self {
            cluster_size,
            hops_to_sink,
            members,
        })
    }
}

/// Handshake opener sent by the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptCustomStart {
    /// Handshake version
    pub version: u8,
    /// Key class to authenticate with
    pub key_id: FmKeyId,
    /// Requested tunnel type
    pub tunnel_type: TunnelType,
    /// Initiator's network
    pub network_id: NetworkId,
}

impl WireMessage for EncryptCustomStart {
    fn message_type(&self) -> MessageType {
        MessageType::EncryptCustomStart
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u32_le(self.key_id.as_u32());
        buf.put_u8(self.tunnel_type as u8);
        buf.put_u16_le(self.network_id);
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::EncryptCustomStart)?;
        need(buf, 8)?;
        Ok(Self {
            version: buf.get_u8(),
            key_id: FmKeyId::try_from(buf.get_u32_le())?,
            tunnel_type: TunnelType::try_from(buf.get_u8())?,
            network_id: buf.get_u16_le(),
        })
    }
}

/// Acceptor nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptCustomANonce {
    /// Random challenge
    pub anonce: [u8; HANDSHAKE_NONCE_SIZE],
}

impl WireMessage for EncryptCustomANonce {
    fn message_type(&self) -> MessageType {
        MessageType::EncryptCustomANonce
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.anonce);
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::EncryptCustomANonce)?;
        need(buf, HANDSHAKE_NONCE_SIZE)?;
        let mut anonce = [0u8; HANDSHAKE_NONCE_SIZE];
        buf.copy_to_slice(&mut anonce);
        Ok(Self { anonce })
    }
}

/// Initiator nonce plus proof of key possession
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptCustomSNonce {
    /// Random challenge
    pub snonce: [u8; HANDSHAKE_NONCE_SIZE],
    /// Tag over the acceptor nonce under the session key
    pub proof: [u8; HANDSHAKE_PROOF_SIZE],
}

impl WireMessage for EncryptCustomSNonce {
    fn message_type(&self) -> MessageType {
        MessageType::EncryptCustomSNonce
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.snonce);
        buf.put_slice(&self.proof);
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::EncryptCustomSNonce)?;
        need(buf, HANDSHAKE_NONCE_SIZE + HANDSHAKE_PROOF_SIZE)?;
        let mut snonce = [0u8; HANDSHAKE_NONCE_SIZE];
        let mut proof = [0u8; HANDSHAKE_PROOF_SIZE];
        buf.copy_to_slice(&mut snonce);
        buf.copy_to_slice(&mut proof);
        Ok(Self { snonce, proof })
    }
}

bitflags! {
    /// Properties of an accepted tunnel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DoneFlags: u8 {
        /// Acceptor exposes its whole mesh
        const REMOTE_MESH = 1 << 0;
        /// Packets after the handshake are sealed
        const SEALED = 1 << 1;
    }
}

/// Acceptor proof plus mesh metadata, ends the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptCustomDone {
    /// Tag over the initiator nonce under the session key
    pub proof: [u8; HANDSHAKE_PROOF_SIZE],
    /// Granted tunnel properties
    pub flags: DoneFlags,
    /// Acceptor's network
    pub network_id: NetworkId,
    /// Acceptor's cluster size
    pub cluster_size: u16,
    /// Acceptor's hops to sink, -1 without a sink
    pub hops_to_sink: i16,
}

impl WireMessage for EncryptCustomDone {
    fn message_type(&self) -> MessageType {
        MessageType::EncryptCustomDone
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.proof);
        buf.put_u8(self.flags.bits());
        buf.put_u16_le(self.network_id);
        buf.put_u16_le(self.cluster_size);
        buf.put_i16_le(self.hops_to_sink);
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        expect_type(message_type, MessageType::EncryptCustomDone)?;
        need(buf, HANDSHAKE_PROOF_SIZE + 7)?;
        let mut proof = [0u8; HANDSHAKE_PROOF_SIZE];
        buf.copy_to_slice(&mut proof);
        let flags = DoneFlags::from_bits(buf.get_u8()).ok_or(WireError::Malformed)?;
        Ok(Self {
            proof,
            flags,
            network_id: buf.get_u16_le(),
            cluster_size: buf.get_u16_le(),
            hops_to_sink: buf.get_i16_le(),
        })
    }
}

/// Module action request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleAction {
    /// Whether this is a response
    pub response: bool,
    /// Target module
    pub module_id: u8,
    /// Caller chosen handle echoed in the response
    pub request_handle: u8,
    /// Module specific action
    pub action_type: u8,
    /// Action payload
    pub payload: Bytes,
}

impl WireMessage for ModuleAction {
    fn message_type(&self) -> MessageType {
        if self.response {
            MessageType::ModuleActionResponse
        } else {
            MessageType::ModuleTriggerAction
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.module_id);
        buf.put_u8(self.request_handle);
        buf.put_u8(self.action_type);
        buf.put_slice(&self.payload);
    }

    fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<Self, WireError> {
        let response = match message_type {
            MessageType::ModuleTriggerAction => false,
            MessageType::ModuleActionResponse => true,
            other => return Err(WireError::Type(other as u8)),
        };
        need(buf, 3)?;
        let module_id = buf.get_u8();
        let request_handle = buf.get_u8();
        let action_type = buf.get_u8();
        let payload = Bytes::copy_from_slice(buf);
        *buf = &[];
        Ok(Self {
            response,
            module_id,
            request_handle,
            action_type,
            payload,
        })
    }
}
