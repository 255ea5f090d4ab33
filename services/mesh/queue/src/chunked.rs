//! Single priority chunk queue.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::{Chunk, DeliveryPriority, MessageHandle, QueueError, MAX_CHUNKS_PER_MESSAGE};

struct QueuedMessage {
    handle: MessageHandle,
    data: Bytes,
    split_size: usize,
    chunk_count: usize,
    /// Chunks already committed
    sent: usize,
}

impl QueuedMessage {
    fn chunk(&self, priority: DeliveryPriority) -> Chunk {
        let start = self.sent * self.split_size;
        let end = (start + self.split_size).min(self.data.len());
        Chunk {
            handle: self.handle,
            priority,
            index: self.sent as u8,
            is_final: self.sent + 1 == self.chunk_count,
            is_split: self.chunk_count > 1,
            payload: self.data.slice(start..end),
        }
    }
}

/// FIFO of messages for one priority class, consumed chunk by chunk.
///
/// Exactly one of [`commit`](Self::commit) or
/// [`rollback_look_ahead`](Self::rollback_look_ahead) has to follow every
/// successful [`peek_next`](Self::peek_next); while a look-ahead is pending
/// the peeked message cannot be cancelled.
pub struct ChunkedPacketQueue {
    priority: DeliveryPriority,
    capacity_bytes: usize,
    max_messages: usize,
    used_bytes: usize,
    messages: VecDeque<QueuedMessage>,
    look_ahead: Option<MessageHandle>,
}

impl ChunkedPacketQueue {
    /// Create a queue holding at most `capacity_bytes` of message data in at
    /// most `max_messages` messages
    pub fn new(priority: DeliveryPriority, capacity_bytes: usize, max_messages: usize) -> Self {
        Self {
            priority,
            capacity_bytes,
            max_messages,
            used_bytes: 0,
            messages: VecDeque::new(),
            look_ahead: None,
        }
    }

    /// Priority class served by this queue
    pub fn priority(&self) -> DeliveryPriority {
        self.priority
    }

    /// Queue a message split into chunks of at most `payload_size_per_split`
    /// bytes. Nothing changes if the message is refused.
    pub fn add(
        &mut self,
        data: Bytes,
        payload_size_per_split: usize,
        handle: MessageHandle,
    ) -> Result<(), QueueError> {
        if data.is_empty() {
            return Err(QueueError::EmptyMessage);
        }
        if payload_size_per_split == 0 {
            return Err(QueueError::InvalidSplitSize);
        }
        let chunk_count = (data.len() + payload_size_per_split - 1) / payload_size_per_split;
        if chunk_count > MAX_CHUNKS_PER_MESSAGE {
            return Err(QueueError::TooManyChunks(chunk_count));
        }
        let available = self.capacity_bytes - self.used_bytes;
        if data.len() > available || self.messages.len() >= self.max_messages {
            debug!(
                "Queue {:?} refused message {} ({} bytes, {} available, {} messages)",
                self.priority,
                handle,
                data.len(),
                available,
                self.messages.len()
            );
            return Err(QueueError::QueueFull {
                needed: data.len(),
                available,
            });
        }

        self.used_bytes += data.len();
        self.messages.push_back(QueuedMessage {
            handle,
            data,
            split_size: payload_size_per_split,
            chunk_count,
            sent: 0,
        });
        Ok(())
    }

    /// Next chunk to send, without removing it
    pub fn peek_next(&mut self) -> Result<Option<Chunk>, QueueError> {
        if self.look_ahead.is_some() {
            return Err(QueueError::LookAheadPending);
        }
        let Some(front) = self.messages.front() else {
            return Ok(None);
        };
        let chunk = front.chunk(self.priority);
        self.look_ahead = Some(front.handle);
        Ok(Some(chunk))
    }

    /// Advance past the peeked chunk. Returns the handle of the message if
    /// that chunk completed it.
    pub fn commit(&mut self) -> Result<Option<MessageHandle>, QueueError> {
        self.look_ahead.take().ok_or(QueueError::NoLookAhead)?;
        let Some(front) = self.messages.front_mut() else {
            return Err(QueueError::NoLookAhead);
        };
        front.sent += 1;
        if front.sent < front.chunk_count {
            return Ok(None);
        }

        let done = self.messages.pop_front();
        Ok(done.map(|message| {
            self.used_bytes -= message.data.len();
            trace!(
                "Queue {:?} finished message {} ({} chunks)",
                self.priority,
                message.handle,
                message.chunk_count
            );
            message.handle
        }))
    }

    /// Forget the peeked chunk so the next peek returns it again
    pub fn rollback_look_ahead(&mut self) -> Result<(), QueueError> {
        self.look_ahead.take().map(|_| ()).ok_or(QueueError::NoLookAhead)
    }

    /// Whether a peek is waiting for commit or rollback
    pub fn has_look_ahead(&self) -> bool {
        self.look_ahead.is_some()
    }

    /// Remove a message none of whose chunks went out yet.
    ///
    /// Returns `Ok(false)` if the handle is not queued here.
    pub fn cancel(&mut self, handle: MessageHandle) -> Result<bool, QueueError> {
        let Some(pos) = self.messages.iter().position(|m| m.handle == handle) else {
            return Ok(false);
        };
        if self.look_ahead == Some(handle) {
            return Err(QueueError::LookAheadPending);
        }
        if self.messages[pos].sent > 0 {
            return Err(QueueError::MessageInFlight(handle));
        }
        if let Some(message) = self.messages.remove(pos) {
            self.used_bytes -= message.data.len();
        }
        Ok(true)
    }

    /// A multi-chunk message has some but not all chunks sent
    pub fn is_currently_sending_split_message(&self) -> bool {
        self.messages.front().map_or(false, |m| m.sent > 0)
    }

    /// Chunks still to be sent
    pub fn amount_of_packets(&self) -> usize {
        self.messages.iter().map(|m| m.chunk_count - m.sent).sum()
    }

    /// Messages still queued
    pub fn amount_of_messages(&self) -> usize {
        self.messages.len()
    }

    /// Whether anything is queued
    pub fn has_packets(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Bytes of backing capacity in use
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Drop everything, including a pending look-ahead
    pub fn clear(&mut self) {
        self.messages.clear();
        self.used_bytes = 0;
        self.look_ahead = None;
    }
}
