//! Mesh-wide logical clock.
//!
//! [`TimeManager`] keeps the node's view of unix time, elects the winning
//! clock through a monotonic sync counter and applies tick corrections sent
//! after an initial sync message. Everything it needs from the node (id,
//! device type, application timer, the connection layer to re-announce time
//! to) is injected through [`TimeContext`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;

pub use manager::{format_timestamp, TimeManager, TimePoint, TimeSyncState};

use mesh_wire::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Clock ticks per second
pub const TICKS_PER_SECOND: u32 = 32768;

/// Role of the device in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Stationary mesh node
    #[default]
    Static,
    /// Mobile mesh node
    Roaming,
    /// Gateway to a backend
    Sink,
    /// Tracked asset; never a time source
    Asset,
    /// Node that never forwards
    Leaf,
}

/// Time sync errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// Only one time synced listener may exist
    #[error("time synced listener already registered")]
    ListenerAlreadyRegistered,
}

/// Connection layer hook asking every link to re-announce the node's time
pub trait TimeSyncNotifier: Send + Sync + Debug {
    /// Clock changed, send fresh sync messages on all links
    fn reset_time_sync(&self);
}

/// Single listener told when a synced clock got its correction
pub trait TimeSyncedListener: Send + Sync + Debug {
    /// Clock is synced and corrected
    fn time_synced(&self);
}

/// Application timer in deciseconds, driven by the tick callback
#[derive(Debug, Default)]
pub struct AppTimer {
    ticks: AtomicU64,
}

impl AppTimer {
    /// Timer starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Elapsed deciseconds
    pub fn ds(&self) -> u32 {
        (self.ticks.load(Ordering::Relaxed) * 10 / TICKS_PER_SECOND as u64) as u32
    }

    /// Elapsed ticks
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Jump to `ds` deciseconds
    pub fn set_ds(&self, ds: u32) {
        self.ticks
            .store(ds as u64 * TICKS_PER_SECOND as u64 / 10, Ordering::Relaxed);
    }

    /// Advance by `ticks`
    pub fn advance(&self, ticks: u32) {
        self.ticks.fetch_add(ticks as u64, Ordering::Relaxed);
    }
}

/// Node capabilities the time manager depends on
#[derive(Debug, Clone)]
pub struct TimeContext {
    /// Local node id, used as sender of sync messages
    pub node_id: NodeId,
    /// Local device type
    pub device_type: DeviceType,
    /// Connection layer to notify after the clock changed
    pub notifier: Arc<dyn TimeSyncNotifier>,
    /// Node application timer
    pub app_timer: Arc<AppTimer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_timer() {
        let timer = AppTimer::new();
        timer.advance(TICKS_PER_SECOND);
        assert_eq!(timer.ds(), 10);
        timer.advance(TICKS_PER_SECOND / 20);
        assert_eq!(timer.ds(), 10);
        timer.set_ds(1234);
        assert_eq!(timer.ds(), 1234);
    }
}
