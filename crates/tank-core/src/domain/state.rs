//! Connection state machine vocabulary.
//!
//! ```text
//!            connect()
//!   Idle ───────────────► Connecting ──handshake ok──► Connected
//!                           ▲   │                        │
//!          backoff elapsed  │   │ handshake fail         │ remote close /
//!                           │   ▼                        │ heartbeat timeout
//!                        Reconnecting ◄──────────────────┘
//!                           │
//!                           │ attempts exhausted
//!                           ▼
//!                         Failed
//!
//!   any state ──disconnect()──► Disconnected
//! ```
//!
//! `Failed` and `Disconnected` are terminal for automatic recovery; only an
//! explicit `connect()` leaves them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of the single device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, never asked to connect.
    Idle,
    /// A WebSocket handshake is in flight.
    Connecting,
    /// The link is open and traffic may flow.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Closed on purpose by the user.
    Disconnected,
    /// Gave up after exhausting reconnect attempts (or the first attempt
    /// failed with reconnect disabled).
    Failed,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// `disconnect()` is legal from every state except `Disconnected` itself,
    /// where it is a no-op rather than a transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Disconnected {
            return self != Disconnected;
        }

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Failed)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
        )
    }

    /// Returns `true` for states that automatic recovery never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
