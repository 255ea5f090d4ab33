//! Time manager state machine.
//!
//! Known limitation: two nodes that start a sync at about the same time with
//! different clocks generate the same counter value, so neither wins and the
//! mesh does not converge from that round. The next sync started anywhere
//! produces a higher counter and resolves it.

use chrono::{DateTime, Utc};
use mesh_wire::{
    NodeId, Packet, TimeSyncInitial, TimeSyncInterNetwork, TimeSyncMessage, UpdateTimestamp,
};
use std::ops::Sub;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::{DeviceType, TimeContext, TimeError, TimeSyncedListener, TICKS_PER_SECOND};

/// Folding threshold keeping the tick accumulator far from overflow
const MAX_PENDING_TICKS: u32 = TICKS_PER_SECOND * 3600;

/// Observable sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncState {
    /// No time received yet
    Unsynced,
    /// Initial sync received, waiting for its correction
    SyncedPendingCorrection,
    /// Time synced and corrected
    SyncedCorrected,
}

/// Instant on the local clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimePoint {
    /// Local unix seconds
    pub unix_time: u32,
    /// Sub-second ticks
    pub additional_ticks: u32,
}

impl TimePoint {
    /// New time point
    pub fn new(unix_time: u32, additional_ticks: u32) -> Self {
        Self {
            unix_time,
            additional_ticks,
        }
    }
}

impl Sub for TimePoint {
    type Output = i64;

    /// Difference in ticks
    fn sub(self, other: TimePoint) -> i64 {
        let seconds = self.unix_time as i64 - other.unix_time as i64;
        let ticks = self.additional_ticks as i64 - other.additional_ticks as i64;
        ticks + seconds * TICKS_PER_SECOND as i64
    }
}

/// Node clock with counter based election
#[derive(Debug)]
pub struct TimeManager {
    ctx: TimeContext,
    sync_time: u32,
    time_since_sync_time: u32,
    additional_ticks: u32,
    offset: i16,
    counter: u32,
    is_time_master: bool,
    waiting_for_correction: bool,
    time_correction_received: bool,
    listener: Option<Arc<dyn TimeSyncedListener>>,
}

impl TimeManager {
    /// Unsynced clock
    pub fn new(ctx: TimeContext) -> Self {
        Self {
            ctx,
            sync_time: 0,
            time_since_sync_time: 0,
            additional_ticks: 0,
            offset: 0,
            counter: 0,
            is_time_master: false,
            waiting_for_correction: false,
            time_correction_received: false,
            listener: None,
        }
    }

    /// Register the single time synced listener
    pub fn add_time_synced_listener(
        &mut self,
        listener: Arc<dyn TimeSyncedListener>,
    ) -> Result<(), TimeError> {
        if self.listener.is_some() {
            return Err(TimeError::ListenerAlreadyRegistered);
        }
        self.listener = Some(listener);
        Ok(())
    }

    /// Tick callback input
    pub fn add_ticks(&mut self, ticks: u32) {
        self.additional_ticks = self.additional_ticks.saturating_add(ticks);
        if self.additional_ticks >= MAX_PENDING_TICKS {
            self.process_ticks();
        }
    }

    /// Fold whole seconds out of the tick accumulator
    pub fn process_ticks(&mut self) {
        let seconds = self.additional_ticks / TICKS_PER_SECOND;
        self.time_since_sync_time = self.time_since_sync_time.wrapping_add(seconds);
        self.additional_ticks -= seconds * TICKS_PER_SECOND;
    }

    /// Current unix time
    pub fn utc_time(&mut self) -> u32 {
        self.process_ticks();
        self.sync_time.wrapping_add(self.time_since_sync_time)
    }

    /// Current local time. A negative offset larger than the UTC time
    /// leaves the UTC time unadjusted.
    pub fn local_time(&mut self) -> u32 {
        let utc = self.utc_time();
        apply_offset(utc, self.offset).unwrap_or(utc)
    }

    /// Local time including sub-second ticks
    pub fn local_time_point(&mut self) -> TimePoint {
        let local = self.local_time();
        TimePoint::new(local, self.additional_ticks)
    }

    /// Local time offset in minutes
    pub fn offset(&self) -> i16 {
        self.offset
    }

    /// Current sync generation
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Whether this node set the time by command
    pub fn is_time_master(&self) -> bool {
        self.is_time_master
    }

    /// Whether any time was received
    pub fn is_time_synced(&self) -> bool {
        self.sync_time != 0
    }

    /// Whether the time is synced and no correction is outstanding
    pub fn is_time_corrected(&self) -> bool {
        (self.time_correction_received || !self.waiting_for_correction) && self.is_time_synced()
    }

    /// Observable sync state
    pub fn state(&self) -> TimeSyncState {
        if !self.is_time_synced() {
            TimeSyncState::Unsynced
        } else if self.waiting_for_correction {
            TimeSyncState::SyncedPendingCorrection
        } else {
            TimeSyncState::SyncedCorrected
        }
    }

    /// Become time master with the given clock
    pub fn set_master_time(
        &mut self,
        sync_time: u32,
        time_since_sync_time: u32,
        offset: i16,
        additional_ticks: u32,
    ) {
        self.sync_time = sync_time;
        self.time_since_sync_time = time_since_sync_time;
        self.additional_ticks = additional_ticks;
        self.offset = offset;
        self.counter = self.counter.wrapping_add(1);
        self.waiting_for_correction = false;
        self.time_correction_received = true;
        self.is_time_master = true;
        info!(
            "Received time by command! NodeId: {}, counter {}",
            self.ctx.node_id, self.counter
        );
        self.ctx.notifier.reset_time_sync();
    }

    /// Adopt an initial sync message if its counter is newer. Returns
    /// whether it was accepted.
    pub fn set_time_initial(&mut self, sender: NodeId, message: &TimeSyncInitial) -> bool {
        if message.counter <= self.counter {
            trace!(
                "Dropping time sync from {} with counter {} (local {})",
                sender,
                message.counter,
                self.counter
            );
            return false;
        }
        self.sync_time = message.sync_time_stamp;
        self.time_since_sync_time = message.time_since_sync_time_stamp;
        self.additional_ticks = message.additional_ticks;
        self.offset = message.offset;
        self.counter = message.counter;
        self.waiting_for_correction = true;
        self.time_correction_received = false;
        self.is_time_master = false;
        self.ctx.app_timer.set_ds(message.app_timer_ds);
        debug!(
            "syncTime {} timeSinceSyncTime {} addTicks {} offset {} counter {}",
            message.sync_time_stamp,
            message.time_since_sync_time_stamp,
            message.additional_ticks,
            message.offset,
            message.counter
        );
        info!(
            "Received time by mesh! NodeId: {}, Partner: {}",
            self.ctx.node_id, sender
        );
        self.ctx.notifier.reset_time_sync();
        true
    }

    /// Adopt an inter network sync message on an unset clock or an asset.
    /// Returns whether it was accepted.
    pub fn set_time_inter_network(
        &mut self,
        sender: NodeId,
        message: &TimeSyncInterNetwork,
    ) -> bool {
        if self.counter != 0 && self.ctx.device_type != DeviceType::Asset {
            trace!("Ignoring inter network time from {}", sender);
            return false;
        }
        self.sync_time = message.sync_time_stamp;
        self.time_since_sync_time = message.time_since_sync_time_stamp;
        self.additional_ticks = message.additional_ticks;
        self.offset = message.offset;
        self.counter = self.counter.wrapping_add(1);
        self.waiting_for_correction = false;
        self.time_correction_received = false;
        self.is_time_master = false;
        info!(
            "Received time by inter mesh! NodeId: {}, Partner: {}",
            self.ctx.node_id, sender
        );
        self.ctx.notifier.reset_time_sync();
        true
    }

    /// Apply the correction following an initial sync message
    pub fn add_correction(&mut self, ticks: u32) {
        if !self.waiting_for_correction {
            return;
        }
        self.additional_ticks = self.additional_ticks.saturating_add(ticks);
        self.ctx.app_timer.advance(ticks);
        self.waiting_for_correction = false;
        self.time_correction_received = true;
        if let Some(listener) = &self.listener {
            listener.time_synced();
        }
        info!("Time synced and corrected");
    }

    /// Dispatch a received time sync message
    pub fn handle_time_sync(&mut self, sender: NodeId, message: &TimeSyncMessage) -> bool {
        match message {
            TimeSyncMessage::Initial(m) => self.set_time_initial(sender, m),
            TimeSyncMessage::InterNetwork(m) => self.set_time_inter_network(sender, m),
            TimeSyncMessage::Correction(m) => {
                let waiting = self.waiting_for_correction;
                self.add_correction(m.correction_ticks);
                waiting
            }
        }
    }

    /// Set the time from an update timestamp command
    pub fn handle_update_timestamp(&mut self, message: &UpdateTimestamp) {
        self.set_master_time(message.timestamp_sec, 0, message.offset.unwrap_or(0), 0);
    }

    /// Initial sync message for a partner of the same network
    pub fn time_sync_initial_message(&mut self, receiver: NodeId) -> Packet<TimeSyncMessage> {
        self.process_ticks();
        Packet::new(
            self.ctx.node_id,
            receiver,
            TimeSyncMessage::Initial(TimeSyncInitial {
                sync_time_stamp: self.sync_time,
                time_since_sync_time_stamp: self.time_since_sync_time,
                additional_ticks: self.additional_ticks,
                offset: self.offset,
                counter: self.counter,
                app_timer_ds: self.ctx.app_timer.ds(),
            }),
        )
    }

    /// Inter network sync message for a partner of a foreign network
    pub fn time_sync_inter_network_message(
        &mut self,
        receiver: NodeId,
    ) -> Packet<TimeSyncMessage> {
        self.process_ticks();
        Packet::new(
            self.ctx.node_id,
            receiver,
            TimeSyncMessage::InterNetwork(TimeSyncInterNetwork {
                sync_time_stamp: self.sync_time,
                time_since_sync_time_stamp: self.time_since_sync_time,
                additional_ticks: self.additional_ticks,
                offset: self.offset,
            }),
        )
    }

    /// Human readable current time
    pub fn format_time(&mut self) -> String {
        let utc = self.utc_time();
        format_timestamp(utc, self.offset, self.additional_ticks)
    }
}

fn apply_offset(utc: u32, offset: i16) -> Option<u32> {
    let offset_seconds = offset as i64 * 60;
    let local = utc as i64 + offset_seconds;
    if local < 0 {
        None
    } else {
        Some(local as u32)
    }
}

/// Render a unix timestamp shifted by `offset` minutes
pub fn format_timestamp(unix_timestamp: u32, offset: i16, ticks: u32) -> String {
    let Some(local) = apply_offset(unix_timestamp, offset) else {
        return format!(
            "Negative Offset ({}) smaller than timestamp ({})",
            offset, unix_timestamp
        );
    };
    match DateTime::<Utc>::from_timestamp(local as i64, 0) {
        Some(time) => format!(
            "{},{} ticks (offset {})",
            time.format("%Y-%m-%d %H:%M:%S"),
            ticks,
            offset
        ),
        None => format!("{}s,{} ticks (offset {})", local, ticks, offset),
    }
}
