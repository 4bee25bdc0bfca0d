//! Keepalive tracking
//!
//! The counting is pure so it can be tested without timers; [`monitor`]
//! drives it against a live channel.

use crate::transport::NotificationChannel;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveVerdict {
    Healthy,
    /// Consecutive misses so far, still under the limit
    Missed(u32),
    Lost,
}

#[derive(Debug, Clone)]
pub struct KeepaliveTracker {
    missed: u32,
    max_missed: u32,
}

impl KeepaliveTracker {
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed: max_missed.max(1),
        }
    }

    /// Fold one probe result into the tracker
    pub fn record(&mut self, alive: bool) -> KeepaliveVerdict {
        if alive {
            self.missed = 0;
            return KeepaliveVerdict::Healthy;
        }
        self.missed += 1;
        if self.missed >= self.max_missed {
            KeepaliveVerdict::Lost
        } else {
            KeepaliveVerdict::Missed(self.missed)
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The channel closed or missed too many keepalives
    Lost,
    Cancelled,
}

/// Probe `channel` every `interval` until it is lost or `cancel` fires
pub async fn monitor(
    channel: &dyn NotificationChannel,
    interval: Duration,
    max_missed: u32,
    cancel: &CancellationToken,
) -> MonitorExit {
    let mut tracker = KeepaliveTracker::new(max_missed);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return MonitorExit::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }

        if !channel.is_open() {
            debug!(channel_id = channel.channel_id(), "Channel closed");
            return MonitorExit::Lost;
        }

        match tracker.record(channel.keepalive().await) {
            KeepaliveVerdict::Healthy => {}
            KeepaliveVerdict::Missed(missed) => {
                warn!(channel_id = channel.channel_id(), missed, max_missed, "Keepalive missed");
            }
            KeepaliveVerdict::Lost => {
                warn!(channel_id = channel.channel_id(), missed = tracker.missed(), "Channel lost");
                return MonitorExit::Lost;
            }
        }
    }
}
