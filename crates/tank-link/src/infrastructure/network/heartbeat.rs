//! Heartbeat monitor: detects a link that is open but silent.
//!
//! A WebSocket whose Wi-Fi peer vanished can stay "open" for minutes before
//! TCP notices.  While the link is `Connected`, this monitor writes a cheap
//! request (by default `getSystemStatusText`) every `interval`.  Any inbound
//! traffic acknowledges it.  When nothing arrives within `interval + grace`
//! of an unacknowledged probe, the probe counts as missed; once
//! `miss_threshold` probes were missed in a row, the monitor asks the
//! connection manager to force-close the link, which then goes through the
//! normal reconnect path.
//!
//! The monitor talks to the manager through [`LivenessTarget`] so it can be
//! tested against a recording double.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use tank_core::{HeartbeatState, MessageEnvelope};

/// Heartbeat tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Extra time allowed on top of `interval` before a probe counts as missed.
    pub grace: Duration,
    /// Consecutive misses that trigger a forced reconnect.  0 is treated as 1.
    pub miss_threshold: u32,
    /// The request written as a probe.
    pub probe: MessageEnvelope,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            grace: Duration::from_millis(2000),
            miss_threshold: 2,
            probe: MessageEnvelope::system_status_text(),
        }
    }
}

/// What the monitor needs from the link it watches.
pub trait LivenessTarget: Send + Sync + 'static {
    /// Writes one probe.  Returns `false` if the link is gone, which stops
    /// the monitor.
    fn send_probe(&self, probe: &MessageEnvelope) -> bool;

    /// Asks for the link to be force-closed and reconnected.
    fn request_reconnect(&self, missed: u32);
}

/// A running heartbeat for one connected session.
///
/// Dropping the monitor stops it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    acks: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Starts probing `target`.  The first probe goes out after one `interval`.
    pub fn start<T: LivenessTarget>(config: HeartbeatConfig, target: T) -> Self {
        let (acks, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, target, rx));
        Self { acks, task }
    }

    /// Records inbound traffic.
    pub fn record_ack(&self) {
        let _ = self.acks.send(());
    }

    /// Stops the monitor.
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<T: LivenessTarget>(
    config: HeartbeatConfig,
    target: T,
    mut acks: mpsc::UnboundedReceiver<()>,
) {
    let window = config.interval + config.grace;
    let mut state = HeartbeatState::new();
    let mut next_probe = Instant::now() + config.interval;

    loop {
        let wake = match state.deadline(window) {
            Some(deadline) => next_probe.min(Instant::from_std(deadline)),
            None => next_probe,
        };

        tokio::select! {
            biased;

            ack = acks.recv() => match ack {
                Some(()) => state.on_ack(Instant::now().into_std()),
                None => return,
            },

            _ = sleep_until(wake) => {
                let now = Instant::now();

                if state.check_expired(now.into_std(), window) {
                    debug!("heartbeat missed ({} in a row)", state.missed_count);
                    if state.threshold_reached(config.miss_threshold) {
                        warn!(
                            "no traffic for {} heartbeat window(s); forcing reconnect",
                            state.missed_count
                        );
                        target.request_reconnect(state.missed_count);
                        return;
                    }
                }

                if now >= next_probe {
                    if !target.send_probe(&config.probe) {
                        debug!("heartbeat target gone; stopping");
                        return;
                    }
                    state.on_probe_sent(now.into_std());
                    next_probe = now + config.interval;
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
