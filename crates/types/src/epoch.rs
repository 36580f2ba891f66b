//! Balancing epoch bookkeeping.

use std::time::Duration;

/// Monotone balancing-epoch counter plus the time of the last completed
/// fleet-wide synchronization, used to gate the periodic balancer.
#[derive(Debug, Clone, Default)]
pub struct EpochCounter {
    epoch: u32,
    last_sync: Duration,
}

impl EpochCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn increment(&mut self) {
        self.epoch += 1;
    }

    pub fn reset_last_sync(&mut self, now: Duration) {
        self.last_sync = now;
    }

    pub fn seconds_since_last_sync(&self, now: Duration) -> f64 {
        now.saturating_sub(self.last_sync).as_secs_f64()
    }
}
