//! Network scanner: finds controllers by probing many addresses.
//!
//! # Two modes
//!
//! - **Quick scan** probes a short candidate list (the last known device
//!   first, then the configured defaults) a few at a time.
//! - **Range scan** probes every host `1..=254` of a `/24` prefix such as
//!   `192.168.1`.
//!
//! # Batching (for beginners)
//!
//! Opening 254 sockets at once would exhaust the controller's tiny Wi-Fi
//! stack and some home routers.  The range scan instead splits the
//! addresses into batches of `batch_size` (20 by default), runs one batch
//! concurrently, waits for *every* probe in it to settle, then moves on:
//!
//! ```text
//!   batch 1: .1 .. .20    ──► all settle (≤ probe_timeout)
//!   batch 2: .21 .. .40   ──► all settle (≤ probe_timeout)
//!   ...
//!   batch 13: .241 .. .254
//! ```
//!
//! Every probe carries its own timeout, so the whole scan takes at most
//! `ceil(254 / batch_size) * probe_timeout`.
//!
//! # Cancellation
//!
//! A [`ScanCancel`] handle is checked at batch boundaries.  Probes already
//! running when it fires are allowed to settle, but their results are
//! thrown away and the result is marked `cancelled`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tank_core::{DeviceEndpoint, DEFAULT_PORT};

use super::probe::probe;
use super::transport::Connector;

/// Highest host number probed in a `/24`; `.0` and `.255` are skipped.
const LAST_HOST: u8 = 254;

/// Error type for scan requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    /// The prefix is not three dot-separated octets.
    #[error("invalid network prefix '{0}': expected three octets such as 192.168.1")]
    InvalidPrefix(String),
}

// ── NetworkPrefix ─────────────────────────────────────────────────────────────

/// The first three octets of an IPv4 `/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkPrefix([u8; 3]);

impl NetworkPrefix {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    /// The dotted address of host `n` in this prefix.
    pub fn host(&self, n: u8) -> String {
        let [a, b, c] = self.0;
        format!("{a}.{b}.{c}.{n}")
    }
}

impl fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

impl FromStr for NetworkPrefix {
    type Err = ScanError;

    /// Parses `a.b.c`; a trailing dot (`192.168.1.`) is tolerated.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScanError::InvalidPrefix(s.to_string());
        let trimmed = s.trim().trim_end_matches('.');

        let octets = trimmed
            .split('.')
            .map(|part| part.parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        match octets.as_slice() {
            [a, b, c] => Ok(Self([*a, *b, *c])),
            _ => Err(invalid()),
        }
    }
}

// ── Config, progress, results ─────────────────────────────────────────────────

/// Scanner tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Probes run concurrently per range-scan batch.
    pub batch_size: usize,
    /// Per-probe timeout.
    pub probe_timeout: Duration,
    /// Port probed on every host.
    pub port: u16,
    /// Addresses tried by a quick scan, in order.
    pub quick_candidates: Vec<String>,
    /// Probes run concurrently during a quick scan.
    pub quick_concurrency: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            probe_timeout: Duration::from_millis(5000),
            port: DEFAULT_PORT,
            quick_candidates: vec![
                "192.168.4.1".to_string(),
                "192.168.1.100".to_string(),
                "192.168.0.100".to_string(),
            ],
            quick_concurrency: 4,
        }
    }
}

/// Emitted after every completed range-scan batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    /// 1-based number of the batch that just finished.
    pub batch: usize,
    pub total_batches: usize,
    /// Devices found so far, this batch included.
    pub found: usize,
}

/// Endpoints that answered, in the order their probes completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub endpoints: Vec<DeviceEndpoint>,
    /// Number of probes whose outcome was kept.
    pub probed: usize,
    /// `true` if the scan stopped early because it was cancelled.
    pub cancelled: bool,
}

impl ScanResult {
    /// Appends `endpoint` unless it is already present.
    fn push(&mut self, endpoint: DeviceEndpoint) {
        if !self.endpoints.contains(&endpoint) {
            self.endpoints.push(endpoint);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn first(&self) -> Option<&DeviceEndpoint> {
        self.endpoints.first()
    }
}

/// Cancels a running scan at its next batch boundary.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Runs probes over candidate lists and address ranges.
#[derive(Clone)]
pub struct NetworkScanner {
    connector: Arc<dyn Connector>,
    config: ScanConfig,
}

impl NetworkScanner {
    pub fn new(connector: Arc<dyn Connector>, config: ScanConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Probes the quick-scan candidates, `last_known` first.
    ///
    /// Candidates without an explicit port use the configured port.
    /// Entries that do not parse are skipped with a warning.
    pub async fn quick_scan(
        &self,
        last_known: Option<&DeviceEndpoint>,
        cancel: &ScanCancel,
    ) -> ScanResult {
        let candidates = self.quick_candidates(last_known);
        let chunk = self.config.quick_concurrency.max(1);
        let mut result = ScanResult::default();

        info!("quick scan over {} candidate(s)", candidates.len());
        for group in candidates.chunks(chunk) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let found = self.probe_batch(group).await;
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            result.probed += group.len();
            for endpoint in found {
                result.push(endpoint);
            }
        }

        info!(
            "quick scan finished: {} device(s){}",
            result.endpoints.len(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
        result
    }

    /// Probes hosts `1..=254` of `prefix` in batches of `batch_size`.
    ///
    /// Batches run in ascending address order.  When `progress` is given, a
    /// [`ScanProgress`] is sent after each batch whose results were kept.
    pub async fn range_scan(
        &self,
        prefix: &NetworkPrefix,
        cancel: &ScanCancel,
        progress: Option<&mpsc::UnboundedSender<ScanProgress>>,
    ) -> ScanResult {
        let endpoints: Vec<DeviceEndpoint> = (1..=LAST_HOST)
            .map(|n| DeviceEndpoint::new(prefix.host(n), self.config.port))
            .collect();
        let batch_size = self.config.batch_size.max(1);
        let total_batches = endpoints.len().div_ceil(batch_size);
        let mut result = ScanResult::default();

        info!(
            "range scan of {prefix}.0/24 port {}: {total_batches} batch(es) of {batch_size}",
            self.config.port
        );

        for (index, batch) in endpoints.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }

            let found = self.probe_batch(batch).await;

            if cancel.is_cancelled() {
                debug!("scan cancelled during batch {}; discarding its results", index + 1);
                result.cancelled = true;
                break;
            }

            result.probed += batch.len();
            for endpoint in found {
                info!("found device at {endpoint}");
                result.push(endpoint);
            }

            if let Some(tx) = progress {
                let _ = tx.send(ScanProgress {
                    batch: index + 1,
                    total_batches,
                    found: result.endpoints.len(),
                });
            }
        }

        info!(
            "range scan of {prefix}.0/24 finished: {} device(s) from {} probe(s){}",
            result.endpoints.len(),
            result.probed,
            if result.cancelled { " (cancelled)" } else { "" }
        );
        result
    }

    /// Probes all `endpoints` concurrently and returns the reachable ones in
    /// completion order.  Returns once every probe has settled.
    pub async fn probe_batch(&self, endpoints: &[DeviceEndpoint]) -> Vec<DeviceEndpoint> {
        let limit = self.config.probe_timeout;
        let connector = self.connector.as_ref();

        let mut pending: FuturesUnordered<_> = endpoints
            .iter()
            .map(|endpoint| async move {
                let outcome = probe(connector, endpoint, limit).await;
                (endpoint, outcome)
            })
            .collect();

        let mut reachable = Vec::new();
        while let Some((endpoint, outcome)) = pending.next().await {
            if outcome.is_reachable() {
                reachable.push(endpoint.clone());
            }
        }
        reachable
    }

    fn quick_candidates(&self, last_known: Option<&DeviceEndpoint>) -> Vec<DeviceEndpoint> {
        let mut candidates: Vec<DeviceEndpoint> = last_known.cloned().into_iter().collect();

        for raw in &self.config.quick_candidates {
            match DeviceEndpoint::parse_with_port(raw, self.config.port) {
                Ok(endpoint) => {
                    if !candidates.contains(&endpoint) {
                        candidates.push(endpoint);
                    }
                }
                Err(e) => warn!("skipping quick-scan candidate '{raw}': {e}"),
            }
        }
        candidates
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
