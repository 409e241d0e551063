//! Typed listener registries and the ordered event dispatcher.
//!
//! The connection manager publishes three kinds of events, one topic each:
//!
//! | Topic    | Payload             | Examples                                 |
//! |----------|---------------------|------------------------------------------|
//! | state    | [`StateChange`]     | `Idle -> Connecting`                     |
//! | message  | [`InboundMessage`]  | a decoded envelope, or undecoded text    |
//! | failure  | [`LinkFailure`]     | handshake timeout, retry scheduled       |
//!
//! # Ordering
//!
//! Events are queued on a single unbounded channel while the manager holds
//! its state lock, and one dispatcher task drains that channel.  So every
//! listener sees events in exactly the order the state machine produced
//! them, across all three topics.
//!
//! # Re-entrancy
//!
//! Listeners run on the dispatcher task, never under the manager's lock, so
//! a listener may call back into the manager (`send`, `disconnect`, even
//! register another listener).  Each dispatch works on a snapshot of the
//! registry: a listener added or removed during a dispatch does not change
//! who receives the event being delivered.
//!
//! A panicking listener is logged and skipped; it does not stop the
//! dispatcher or the other listeners.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use tank_core::{ConnectionState, DeviceEndpoint, InboundMessage};

/// Handle returned by every listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// The endpoint the manager was targeting when the transition happened.
    pub endpoint: Option<DeviceEndpoint>,
}

/// Link failures and recovery progress.
///
/// Transient failures are reported here for visibility; they are never
/// returned as errors from `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkFailure {
    /// No handshake within the handshake timeout.
    HandshakeTimeout {
        endpoint: DeviceEndpoint,
        timeout: Duration,
    },
    /// The connection or WebSocket upgrade was rejected.
    HandshakeError {
        endpoint: DeviceEndpoint,
        reason: String,
    },
    /// The peer or the network closed an established link.
    TransportClosedUnexpectedly {
        endpoint: DeviceEndpoint,
        reason: Option<String>,
    },
    /// The heartbeat monitor gave up on a silent link.
    HeartbeatTimeout {
        endpoint: DeviceEndpoint,
        missed: u32,
    },
    /// A retry timer was armed.  `attempt` is 1-based.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Retries are exhausted; the manager is now `Failed`.
    MaxReconnectAttemptsExceeded {
        endpoint: DeviceEndpoint,
        attempts: u32,
    },
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFailure::HandshakeTimeout { endpoint, timeout } => {
                write!(f, "handshake with {endpoint} timed out after {timeout:?}")
            }
            LinkFailure::HandshakeError { endpoint, reason } => {
                write!(f, "handshake with {endpoint} failed: {reason}")
            }
            LinkFailure::TransportClosedUnexpectedly { endpoint, reason } => match reason {
                Some(reason) => write!(f, "link to {endpoint} closed: {reason}"),
                None => write!(f, "link to {endpoint} closed"),
            },
            LinkFailure::HeartbeatTimeout { endpoint, missed } => {
                write!(f, "{endpoint} missed {missed} heartbeat(s)")
            }
            LinkFailure::ReconnectScheduled { attempt, delay } => {
                write!(f, "reconnect attempt {attempt} in {delay:?}")
            }
            LinkFailure::MaxReconnectAttemptsExceeded { endpoint, attempts } => {
                write!(f, "gave up on {endpoint} after {attempts} reconnect attempt(s)")
            }
        }
    }
}

/// Anything the manager publishes.
#[derive(Debug, Clone)]
pub(crate) enum Event {
    State(StateChange),
    Message(InboundMessage),
    Failure(LinkFailure),
}

// ── Registry ──────────────────────────────────────────────────────────────────

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Listeners for one topic.
struct Registry<T> {
    entries: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: ListenerId, listener: Listener<T>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Calls every listener registered at the time of the call.
    fn deliver(&self, topic: &str, event: &T) {
        let snapshot: Vec<Listener<T>> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("{topic} listener panicked; continuing with the remaining listeners");
            }
        }
    }
}

/// The three topic registries plus the id counter.
pub(crate) struct Listeners {
    next_id: AtomicU64,
    states: Registry<StateChange>,
    messages: Registry<InboundMessage>,
    failures: Registry<LinkFailure>,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            states: Registry::new(),
            messages: Registry::new(),
            failures: Registry::new(),
        }
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn on_state<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.states.add(id, Arc::new(listener));
        id
    }

    pub(crate) fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.messages.add(id, Arc::new(listener));
        id
    }

    pub(crate) fn on_failure<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LinkFailure) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.failures.add(id, Arc::new(listener));
        id
    }

    /// Detaches a listener from whichever topic it was registered on.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        self.states.remove(id) || self.messages.remove(id) || self.failures.remove(id)
    }

    pub(crate) fn count(&self) -> usize {
        self.states.len() + self.messages.len() + self.failures.len()
    }

    pub(crate) fn deliver(&self, event: &Event) {
        match event {
            Event::State(change) => self.states.deliver("state", change),
            Event::Message(message) => self.messages.deliver("message", message),
            Event::Failure(failure) => self.failures.deliver("failure", failure),
        }
    }
}

/// Spawns the task that drains `events` into `listeners`.
///
/// The task ends when every sender is dropped.
pub(crate) fn spawn_dispatcher(
    listeners: Arc<Listeners>,
    mut events: mpsc::UnboundedReceiver<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            listeners.deliver(&event);
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
