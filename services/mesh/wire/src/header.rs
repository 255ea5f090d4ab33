//! Packet header shared by every message crossing a mesh access link.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{NodeId, WireError};

/// Packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 5;

/// Message types understood by the mesh access core
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Non-final chunk of a split packet
    SplitWriteCmd = 16,
    /// Final chunk of a split packet
    SplitWriteCmdEnd = 17,
    /// Cluster size, sink distance and members of the sender's mesh
    ClusterInfoUpdate = 23,
    /// Handshake: initiator announces key class and tunnel type
    EncryptCustomStart = 25,
    /// Handshake: acceptor nonce
    EncryptCustomANonce = 26,
    /// Handshake: initiator nonce and proof
    EncryptCustomSNonce = 27,
    /// Handshake: acceptor proof and mesh metadata
    EncryptCustomDone = 28,
    /// Command making the receiver time master
    UpdateTimestamp = 30,
    /// Module action request
    ModuleTriggerAction = 51,
    /// Module action response
    ModuleActionResponse = 52,
    /// Time sync beacon
    TimeSync = 62,
    /// Opaque application payload
    Data1 = 80,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            16 => Ok(MessageType::SplitWriteCmd),
            17 => Ok(MessageType::SplitWriteCmdEnd),
            23 => Ok(MessageType::ClusterInfoUpdate),
            25 => Ok(MessageType::EncryptCustomStart),
            26 => Ok(MessageType::EncryptCustomANonce),
            27 => Ok(MessageType::EncryptCustomSNonce),
            28 => Ok(MessageType::EncryptCustomDone),
            30 => Ok(MessageType::UpdateTimestamp),
            51 => Ok(MessageType::ModuleTriggerAction),
            52 => Ok(MessageType::ModuleActionResponse),
            62 => Ok(MessageType::TimeSync),
            80 => Ok(MessageType::Data1),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl MessageType {
    /// Handshake messages are the only ones allowed before a tunnel is up
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::EncryptCustomStart
                | MessageType::EncryptCustomANonce
                | MessageType::EncryptCustomSNonce
                | MessageType::EncryptCustomDone
        )
    }
}

/// Packet header: message type, sender and receiver.
///
/// The message type is kept raw so that packets of types this crate does
/// not know can still be routed and remapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw message type
    pub message_type: u8,
    /// Originating node
    pub sender: NodeId,
    /// Destination node, or broadcast
    pub receiver: NodeId,
}

impl PacketHeader {
    /// Create a header for a known message type
    pub fn new(message_type: MessageType, sender: NodeId, receiver: NodeId) -> Self {
        Self {
            message_type: message_type as u8,
            sender,
            receiver,
        }
    }

    /// Typed message type
    pub fn kind(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.message_type)
    }

    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type);
        buf.put_u16_le(self.sender);
        buf.put_u16_le(self.receiver);
    }

    /// Decode header from the front of `buf`, advancing it
    pub fn decode(buf: &mut &[u8]) -> Result<Self, WireError> {
        if buf.remaining() < PACKET_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        Ok(Self {
            message_type: buf.get_u8(),
            sender: buf.get_u16_le(),
            receiver: buf.get_u16_le(),
        })
    }

    /// Read the header of a packet without consuming it
    pub fn peek(packet: &[u8]) -> Result<Self, WireError> {
        let mut buf = packet;
        Self::decode(&mut buf)
    }

    /// Overwrite the sender field of an encoded packet
    pub fn rewrite_sender(packet: &mut [u8], sender: NodeId) -> Result<(), WireError> {
        if packet.len() < PACKET_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        packet[1..3].copy_from_slice(&sender.to_le_bytes());
        Ok(())
    }

    /// Overwrite the receiver field of an encoded packet
    pub fn rewrite_receiver(packet: &mut [u8], receiver: NodeId) -> Result<(), WireError> {
        if packet.len() < PACKET_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        packet[3..5].copy_from_slice(&receiver.to_le_bytes());
        Ok(())
    }
}
