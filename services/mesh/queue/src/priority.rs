//! Droplet-fair multiplexing of the per-priority queues.

use bytes::Bytes;
use tracing::trace;

use crate::{
    Chunk, ChunkedPacketQueue, DeliveryPriority, MessageHandle, QueueError,
    AMOUNT_OF_PRIORITY_DROPLETS_UNTIL_OVERFLOW, AMOUNT_OF_SEND_QUEUE_PRIORITIES,
};

type Droplets = [u8; AMOUNT_OF_SEND_QUEUE_PRIORITIES];

/// One [`ChunkedPacketQueue`] per priority class plus a droplet counter per
/// class.
///
/// A class is served at most [`AMOUNT_OF_PRIORITY_DROPLETS_UNTIL_OVERFLOW`]
/// times in a row; once every class is empty or saturated all counters are
/// reset. With two busy classes the service order is `0, 0, 1, 1, 0, 0, ...`.
pub struct ChunkedPriorityPacketQueue {
    queues: [ChunkedPacketQueue; AMOUNT_OF_SEND_QUEUE_PRIORITIES],
    droplets: Droplets,
    next_handle: u32,
    /// Class of the pending peek and the droplets before it was selected
    look_ahead: Option<(DeliveryPriority, Droplets)>,
}

impl ChunkedPriorityPacketQueue {
    /// Create the queues, each with its own byte and message capacity
    pub fn new(capacity_bytes_per_priority: usize, max_messages_per_priority: usize) -> Self {
        Self {
            queues: DeliveryPriority::ALL.map(|priority| {
                ChunkedPacketQueue::new(
                    priority,
                    capacity_bytes_per_priority,
                    max_messages_per_priority,
                )
            }),
            droplets: [0; AMOUNT_OF_SEND_QUEUE_PRIORITIES],
            next_handle: 1,
            look_ahead: None,
        }
    }

    /// Queue a message on `priority`, split into chunks of at most
    /// `payload_size_per_split` bytes
    pub fn split_and_add_message(
        &mut self,
        priority: DeliveryPriority,
        data: Bytes,
        payload_size_per_split: usize,
    ) -> Result<MessageHandle, QueueError> {
        let handle = MessageHandle(self.next_handle);
        self.queues[priority.index()].add(data, payload_size_per_split, handle)?;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        Ok(handle)
    }

    /// Select the class to serve next and spend one of its droplets
    pub fn get_send_queue(&mut self) -> Option<DeliveryPriority> {
        for _ in 0..2 {
            for priority in DeliveryPriority::ALL {
                let i = priority.index();
                if self.queues[i].has_packets()
                    && self.droplets[i] < AMOUNT_OF_PRIORITY_DROPLETS_UNTIL_OVERFLOW
                {
                    self.droplets[i] += 1;
                    return Some(priority);
                }
            }
            if !self.queues.iter().any(ChunkedPacketQueue::has_packets) {
                return None;
            }
            trace!("All send queues empty or saturated, resetting droplets");
            self.droplets = [0; AMOUNT_OF_SEND_QUEUE_PRIORITIES];
        }
        None
    }

    /// Peek the next chunk of the class chosen by [`get_send_queue`](Self::get_send_queue)
    pub fn peek_next(&mut self) -> Result<Option<Chunk>, QueueError> {
        if self.look_ahead.is_some() {
            return Err(QueueError::LookAheadPending);
        }
        let before = self.droplets;
        let Some(priority) = self.get_send_queue() else {
            return Ok(None);
        };
        let chunk = self.queues[priority.index()].peek_next()?;
        if chunk.is_some() {
            self.look_ahead = Some((priority, before));
        }
        Ok(chunk)
    }

    /// Commit the pending look-ahead
    pub fn commit(&mut self) -> Result<Option<MessageHandle>, QueueError> {
        let (priority, _) = self.look_ahead.take().ok_or(QueueError::NoLookAhead)?;
        self.queues[priority.index()].commit()
    }

    /// Roll back the pending look-ahead in the class it came from. The
    /// droplet it spent is refunded so the next peek returns the same chunk.
    pub fn rollback_look_ahead(&mut self) -> Result<(), QueueError> {
        let (priority, droplets) = self.look_ahead.take().ok_or(QueueError::NoLookAhead)?;
        self.droplets = droplets;
        self.queues[priority.index()].rollback_look_ahead()
    }

    /// Cancel a message that has no chunk sent yet
    pub fn cancel(&mut self, handle: MessageHandle) -> Result<bool, QueueError> {
        for queue in self.queues.iter_mut() {
            if queue.cancel(handle)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Some class is in the middle of a multi-chunk message
    pub fn is_currently_sending_split_message(&self) -> bool {
        self.queues
            .iter()
            .any(ChunkedPacketQueue::is_currently_sending_split_message)
    }

    /// Chunks still to be sent over all classes
    pub fn amount_of_packets(&self) -> usize {
        self.queues.iter().map(ChunkedPacketQueue::amount_of_packets).sum()
    }

    /// Whether anything is queued
    pub fn has_packets(&self) -> bool {
        self.queues.iter().any(ChunkedPacketQueue::has_packets)
    }

    /// Queue of one class
    pub fn queue_by_priority(&self, priority: DeliveryPriority) -> &ChunkedPacketQueue {
        &self.queues[priority.index()]
    }

    /// Current droplet counters, highest class first
    pub fn droplets(&self) -> Droplets {
        self.droplets
    }

    /// Drop all queued traffic and fairness state
    pub fn clear(&mut self) {
        for queue in self.queues.iter_mut() {
            queue.clear();
        }
        self.droplets = [0; AMOUNT_OF_SEND_QUEUE_PRIORITIES];
        self.look_ahead = None;
    }
}
