//! Heartbeat packets and the refresh/heartbeat schedule.

use bytes::Bytes;
use midea_wire::PacketBuilder;
use std::time::Duration;
use tokio::time::Instant;

/// Build a heartbeat packet for `device_id`
pub fn build_heartbeat(device_id: u64) -> Bytes {
    PacketBuilder::new(device_id).heartbeat()
}

/// Tracks when the next status refresh and heartbeat are due
#[derive(Debug, Clone)]
pub struct KeepaliveSchedule {
    refresh_interval: Duration,
    heartbeat_interval: Duration,
    last_refresh: Instant,
    last_heartbeat: Instant,
}

impl KeepaliveSchedule {
    /// Start both timers at `now`; a zero refresh interval disables refreshes
    pub fn new(refresh_interval: Duration, heartbeat_interval: Duration, now: Instant) -> Self {
        Self {
            refresh_interval,
            heartbeat_interval,
            last_refresh: now,
            last_heartbeat: now,
        }
    }

    /// Whether a status refresh should be sent
    pub fn refresh_due(&self, now: Instant) -> bool {
        !self.refresh_interval.is_zero()
            && now.saturating_duration_since(self.last_refresh) >= self.refresh_interval
    }

    /// Whether a heartbeat should be sent
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_heartbeat) >= self.heartbeat_interval
    }

    /// Restart the refresh timer
    pub fn refreshed(&mut self, now: Instant) {
        self.last_refresh = now;
    }

    /// Restart the heartbeat timer
    pub fn heartbeat_sent(&mut self, now: Instant) {
        self.last_heartbeat = now;
    }

    /// Change the refresh interval, keeping the timer
    pub fn set_refresh_interval(&mut self, interval: Duration) {
        self.refresh_interval = interval;
    }
}
