//! Single-attempt reachability check.
//!
//! A probe opens a WebSocket to one endpoint, waits at most `timeout` for
//! the handshake, and closes the link again straight away.  There are no
//! retries; the scanner and the connection manager decide what to do with
//! a miss.
//!
//! Refusals and timeouts are the normal result for most addresses during a
//! range scan, so they are logged at `trace` level only.

use std::fmt;
use std::time::Duration;

use tokio::time::timeout;
use tracing::trace;

use tank_core::DeviceEndpoint;

use super::transport::{Connector, TransportError};

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The WebSocket handshake completed in time.
    Reachable,
    /// The connection or handshake failed.
    Refused(TransportError),
    /// Nothing answered before the timeout.
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Reachable => write!(f, "reachable"),
            ProbeOutcome::Refused(e) => write!(f, "refused: {e}"),
            ProbeOutcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Checks whether a WebSocket at `endpoint` accepts a connection within `limit`.
///
/// A link that does open is closed before this function returns.
pub async fn probe(
    connector: &dyn Connector,
    endpoint: &DeviceEndpoint,
    limit: Duration,
) -> ProbeOutcome {
    let outcome = match timeout(limit, connector.open(endpoint)).await {
        Ok(Ok(link)) => {
            link.close();
            ProbeOutcome::Reachable
        }
        Ok(Err(e)) => ProbeOutcome::Refused(e),
        Err(_elapsed) => ProbeOutcome::TimedOut,
    };
    trace!("probe {endpoint}: {outcome}");
    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
