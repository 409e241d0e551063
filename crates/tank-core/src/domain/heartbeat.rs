//! Liveness bookkeeping for the heartbeat monitor.
//!
//! The monitor sends a probe every `interval`.  A probe counts as missed when
//! no traffic at all arrives within `interval + grace` of the first
//! unacknowledged probe.  Any inbound frame acknowledges, not only a pong.
//!
//! The clock is passed in so the logic can be tested with fixed instants.

use std::time::{Duration, Instant};

/// Liveness counters for one connected session.
///
/// A fresh value is created every time the link enters `Connected`, which
/// is how the counters "reset to zero" on reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// When the most recent probe was written.
    pub last_sent_at: Option<Instant>,
    /// When the most recent inbound traffic arrived.
    pub last_ack_at: Option<Instant>,
    /// Consecutive probe windows that expired without traffic.
    pub missed_count: u32,
    /// Send time of the oldest probe still waiting for traffic.
    awaiting_since: Option<Instant>,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a probe was written at `now`.
    pub fn on_probe_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    /// Records inbound traffic at `now`; clears the miss counter.
    pub fn on_ack(&mut self, now: Instant) {
        self.last_ack_at = Some(now);
        self.missed_count = 0;
        self.awaiting_since = None;
    }

    /// The instant at which the outstanding probe expires, if one is outstanding.
    pub fn deadline(&self, window: Duration) -> Option<Instant> {
        self.awaiting_since.map(|since| since + window)
    }

    /// Counts a miss if the outstanding probe's window has elapsed at `now`.
    ///
    /// Each outstanding probe is counted at most once.  Returns `true` when a
    /// miss was recorded by this call.
    pub fn check_expired(&mut self, now: Instant, window: Duration) -> bool {
        match self.deadline(window) {
            Some(deadline) if now >= deadline => {
                self.missed_count = self.missed_count.saturating_add(1);
                self.awaiting_since = None;
                true
            }
            _ => false,
        }
    }

    /// Returns `true` once `missed_count` has reached `threshold`.
    ///
    /// A threshold of 0 is treated as 1.
    pub fn threshold_reached(&self, threshold: u32) -> bool {
        self.missed_count >= threshold.max(1)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
