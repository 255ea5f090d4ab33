//! Chunked packet queues for mesh access links.
//!
//! A [`ChunkedPacketQueue`] stores whole messages for one priority class and
//! hands them out chunk by chunk through a peek/commit protocol, so a send
//! the link refused can be retried without reordering anything. A
//! [`ChunkedPriorityPacketQueue`] composes one queue per
//! [`DeliveryPriority`] and picks the class to serve next with droplet
//! fairness.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunked;
pub mod priority;

pub use chunked::ChunkedPacketQueue;
pub use priority::ChunkedPriorityPacketQueue;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of priority classes
pub const AMOUNT_OF_SEND_QUEUE_PRIORITIES: usize = 4;

/// Consecutive services a class gets before it has to yield
pub const AMOUNT_OF_PRIORITY_DROPLETS_UNTIL_OVERFLOW: u8 = 2;

const _: () = assert!(AMOUNT_OF_PRIORITY_DROPLETS_UNTIL_OVERFLOW > 0);

/// Maximum chunks per message, bounded by the split header's chunk index
pub use mesh_wire::MAX_CHUNKS_PER_MESSAGE;

/// Priority class of a queued message, highest first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryPriority {
    /// Control traffic the link cannot work without
    Vital = 0,
    /// Time sync and handshake follow-ups
    High = 1,
    /// Regular application traffic
    Medium = 2,
    /// Bulk traffic
    Low = 3,
}

impl DeliveryPriority {
    /// All classes, highest first
    pub const ALL: [DeliveryPriority; AMOUNT_OF_SEND_QUEUE_PRIORITIES] = [
        DeliveryPriority::Vital,
        DeliveryPriority::High,
        DeliveryPriority::Medium,
        DeliveryPriority::Low,
    ];

    /// Array index of the class
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for DeliveryPriority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        DeliveryPriority::ALL
            .get(value as usize)
            .copied()
            .ok_or(QueueError::InvalidPriority(value))
    }
}

/// Handle identifying a queued message
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageHandle(pub u32);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One chunk handed out by a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Message the chunk belongs to
    pub handle: MessageHandle,
    /// Priority class of the message
    pub priority: DeliveryPriority,
    /// 0-based position within the message
    pub index: u8,
    /// Last chunk of the message
    pub is_final: bool,
    /// Message needed more than one chunk
    pub is_split: bool,
    /// Chunk bytes
    pub payload: Bytes,
}

/// Queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Not enough backing capacity for the message
    #[error("queue full: {needed} bytes needed, {available} available")]
    QueueFull {
        /// Bytes the message needs
        needed: usize,
        /// Bytes still free
        available: usize,
    },
    /// Empty messages are not queued
    #[error("empty message")]
    EmptyMessage,
    /// Split size of zero
    #[error("invalid split size")]
    InvalidSplitSize,
    /// Message would need more chunks than the split counter can express
    #[error("message needs {0} chunks")]
    TooManyChunks(usize),
    /// A peeked chunk has not been committed or rolled back
    #[error("look-ahead pending")]
    LookAheadPending,
    /// Commit or rollback without a peek
    #[error("no look-ahead pending")]
    NoLookAhead,
    /// Part of the message already went out
    #[error("message {0} partially sent")]
    MessageInFlight(MessageHandle),
    /// Unknown priority value
    #[error("invalid priority {0}")]
    InvalidPriority(u8),
}
