//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Packet shorter than its fixed layout
    #[error("incomplete packet")]
    Incomplete,

    /// Unknown or unexpected message type
    #[error("unknown type {0}")]
    Type(u8),

    /// Unknown enum value inside a message body
    #[error("unknown code {0}")]
    Code(u32),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Split chunk arrived out of order
    #[error("split sequence broken on priority {priority}: expected {expected}, got {got}")]
    Sequence {
        /// Priority class of the chunk stream
        priority: u8,
        /// Counter the reassembler waited for
        expected: u8,
        /// Counter that arrived
        got: u8,
    },

    /// Sealing or opening a packet failed
    #[error("packet authentication failed")]
    Crypto,

    /// Malformed packet structure
    #[error("malformed packet")]
    Malformed,
}
