//! Packet headers, message codecs and chunk framing for mesh access tunnels.
//!
//! Everything that crosses a mesh access link is a *packet*: a 5-byte
//! [`PacketHeader`] followed by a message body. Packets larger than the link
//! payload are carried as a sequence of split chunks that the receiving side
//! stitches back together with a [`Reassembler`].
//!
//! ## Wire Format
//!
//! ```text
//! unsplit packet:
//! +-----------------+------------------+------------------+----------------+
//! | u8 message_type | u16 sender (LE)  | u16 receiver (LE)| body           |
//! +-----------------+------------------+------------------+----------------+
//!
//! split chunk:
//! +------------------------------+-------------+------------+--------------+
//! | u8 SPLIT_WRITE_CMD[_END]     | u8 priority | u8 counter | packet slice |
//! +------------------------------+-------------+------------+--------------+
//! ```
//!
//! Once a tunnel is encrypted, every raw chunk is sealed with AES-128-GCM and
//! carries a trailing 16-byte tag (see [`codec`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod chunk;
pub mod codec;
pub mod error;
pub mod header;
pub mod ids;
pub mod message;

// Re-export main types
pub use access::{FmKeyId, TunnelType};
pub use chunk::{is_split_chunk, Reassembler, SplitHeader, MAX_CHUNKS_PER_MESSAGE, SPLIT_HEADER_SIZE};
pub use codec::{encrypt_block, keystream_block, open_packet, packet_nonce, proof_tag, seal_packet, MIC_SIZE};
pub use error::WireError;
pub use header::{MessageType, PacketHeader, PACKET_HEADER_SIZE};
pub use ids::{
    BleAddress, NetworkId, NodeId, NODE_ID_ASSET_BASE, NODE_ID_BROADCAST, NODE_ID_GROUP_BASE,
    NODE_ID_VIRTUAL_BASE,
};
pub use message::{
    ClusterInfoUpdate, DoneFlags, EncryptCustomANonce, EncryptCustomDone, EncryptCustomSNonce,
    EncryptCustomStart, ModuleAction, Packet, TimeSyncCorrection, TimeSyncInitial,
    TimeSyncInterNetwork, TimeSyncMessage, TimeSyncType, UpdateTimestamp, WireMessage,
    HANDSHAKE_NONCE_SIZE, HANDSHAKE_PROOF_SIZE,
};
