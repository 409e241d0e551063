//! ConnectionManager: owns the single link to the controller and keeps it up.
//!
//! # State machine
//!
//! ```text
//!            connect()                 handshake ok
//!   Idle ───────────────► Connecting ───────────────► Connected
//!                          ▲     │ handshake fail           │ peer close /
//!           backoff elapsed│     │ or timeout               │ heartbeat timeout
//!                          │     ▼                          ▼
//!                        Reconnecting ◄─────────────────────┘
//!                          │
//!                          │ retries exhausted
//!                          ▼
//!                        Failed
//!
//!   disconnect() from any state ──► Disconnected
//! ```
//!
//! `Failed` and `Disconnected` are left only through an explicit
//! [`ConnectionManager::connect`], which also resets the retry counter.
//!
//! # Concurrency model (for beginners)
//!
//! The manager is a cheap, cloneable handle around shared state guarded by
//! one `std::sync::Mutex`.  The lock is only ever held for short,
//! non-blocking bookkeeping; all waiting happens in spawned Tokio tasks:
//!
//! - an **attempt** task per handshake (pre-flight probe + `Connector::open`
//!   under the handshake timeout),
//! - a **backoff** task per scheduled retry (one `sleep`),
//! - a **session** task per open link, forwarding inbound frames,
//! - the [`HeartbeatMonitor`] task while `Connected`.
//!
//! Each of these tasks remembers the *epoch* that spawned it.  Every
//! `connect`, `disconnect`, retry and forced close bumps the epoch, so a
//! task that wakes up late finds a different epoch and does nothing.  That
//! is how "cancel the pending timer" and "ignore a close that belongs to a
//! link we already abandoned" are guaranteed without racing.
//!
//! Events are queued under the lock and delivered by a separate dispatcher
//! task (see `events`), so listeners observe transitions in the exact order
//! they were applied and may call back into the manager freely.
//!
//! A Tokio runtime must be running when a manager is created.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use tank_core::{
    decode_inbound, encode, CodecError, ConnectionState, DeviceEndpoint, InboundMessage,
    MessageEnvelope, ReconnectPolicy,
};

use super::events::{spawn_dispatcher, Event, LinkFailure, ListenerId, Listeners, StateChange};
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor, LivenessTarget};
use super::probe::probe;
use super::transport::{Connector, Link, LinkEvent, Outbound};

/// Error returned synchronously by [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The link is not `Connected`; nothing was written.
    #[error("cannot send while the link is {state}")]
    NotConnected { state: ConnectionState },

    /// The envelope could not be encoded.
    #[error("cannot encode message: {0}")]
    Encode(#[from] CodecError),

    /// The transport writer has already shut down.
    #[error("link closed before the message could be queued")]
    TransportGone,
}

/// Behaviour of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Reconnect automatically after unintentional closes.
    pub reconnect: bool,
    pub policy: ReconnectPolicy,
    /// Upper bound for one WebSocket handshake.
    pub handshake_timeout: Duration,
    /// When set, every attempt first runs a probe with this timeout.
    pub preflight_timeout: Option<Duration>,
    /// When set, a heartbeat runs while `Connected`.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            policy: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_millis(10_000),
            preflight_timeout: None,
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }
}

/// Read-only snapshot of the link, suitable for a UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub endpoint: Option<DeviceEndpoint>,
    /// Retries scheduled since the last successful handshake.
    pub reconnect_attempt: u32,
    /// Text frames received over the manager's lifetime.
    pub messages_received: u64,
    /// Unix time in milliseconds of the last received text frame.
    pub last_message_at: Option<u64>,
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Core {
    state: ConnectionState,
    endpoint: Option<DeviceEndpoint>,
    attempts: u32,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    attempt_task: Option<JoinHandle<()>>,
    backoff_task: Option<JoinHandle<()>>,
    session_task: Option<JoinHandle<()>>,
    heartbeat: Option<HeartbeatMonitor>,
    messages_received: u64,
    last_message_at: Option<u64>,
}

impl Core {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            endpoint: None,
            attempts: 0,
            epoch: 0,
            outbound: None,
            attempt_task: None,
            backoff_task: None,
            session_task: None,
            heartbeat: None,
            messages_received: 0,
            last_message_at: None,
        }
    }

    /// Closes the transport and stops the heartbeat.  The session task is
    /// aborted only when `abort_session` is set; the session task itself
    /// passes `false`.
    fn close_link(&mut self, abort_session: bool) {
        if let Some(session) = self.session_task.take() {
            if abort_session {
                session.abort();
            }
        }
        self.heartbeat = None;
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
    }

    /// Cancels every timer and task and closes the transport.
    fn release(&mut self) {
        for task in [self.attempt_task.take(), self.backoff_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.close_link(true);
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    core: Mutex<Core>,
    events: mpsc::UnboundedSender<Event>,
    listeners: Arc<Listeners>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.core
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
    }
}

// ── ConnectionManager ─────────────────────────────────────────────────────────

/// Handle to the link state machine.  Clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by tasks and listeners that must not keep the
/// manager alive.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl ConnectionManager {
    /// Creates an `Idle` manager.  Must be called inside a Tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Listeners::new());
        spawn_dispatcher(Arc::clone(&listeners), rx);

        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                core: Mutex::new(Core::new()),
                events,
                listeners,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn endpoint(&self) -> Option<DeviceEndpoint> {
        self.lock().endpoint.clone()
    }

    pub fn status(&self) -> LinkStatus {
        let core = self.lock();
        LinkStatus {
            state: core.state,
            endpoint: core.endpoint.clone(),
            reconnect_attempt: core.attempts,
            messages_received: core.messages_received,
            last_message_at: core.last_message_at,
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Starts connecting to `endpoint`.
    ///
    /// Returns immediately; the outcome arrives as state changes.
    ///
    /// - Already `Connecting`/`Connected` to the same endpoint: no-op.
    /// - `Connecting`/`Connected` to another endpoint: the old link is closed
    ///   (`Disconnected`) before the new attempt starts.
    /// - `Reconnecting`: the pending retry is cancelled and an attempt starts
    ///   now.
    /// - `Idle`, `Disconnected`, `Failed`: a fresh attempt starts.
    ///
    /// In every case that starts an attempt the retry counter is reset.
    pub fn connect(&self, endpoint: DeviceEndpoint) {
        let mut core = self.lock();
        let same_target = core.endpoint.as_ref() == Some(&endpoint);

        match core.state {
            ConnectionState::Connecting | ConnectionState::Connected if same_target => {
                debug!("connect({endpoint}) ignored: already {}", core.state);
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!("switching device to {endpoint}");
                core.release();
                core.epoch += 1;
                self.transition(&mut core, ConnectionState::Disconnected);
            }
            ConnectionState::Reconnecting => core.release(),
            ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed => {}
        }

        core.endpoint = Some(endpoint);
        core.attempts = 0;
        self.begin_attempt(&mut core);
    }

    /// Closes the link on purpose and cancels any pending retry.
    ///
    /// A no-op when already `Disconnected`.
    pub fn disconnect(&self) {
        let mut core = self.lock();
        if core.state == ConnectionState::Disconnected {
            debug!("disconnect ignored: already disconnected");
            return;
        }
        core.release();
        core.epoch += 1;
        self.transition(&mut core, ConnectionState::Disconnected);
    }

    /// Queues `envelope` for writing.
    ///
    /// Never waits for the network.  Fails fast with
    /// [`SendError::NotConnected`] unless the link is `Connected`.
    pub fn send(&self, envelope: &MessageEnvelope) -> Result<(), SendError> {
        let core = self.lock();
        Self::send_locked(&core, envelope)
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.listeners.on_state(listener)
    }

    /// Registers for every inbound text frame, decoded or not.
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.inner.listeners.on_message(listener)
    }

    pub fn on_failure<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LinkFailure) + Send + Sync + 'static,
    {
        self.inner.listeners.on_failure(listener)
    }

    /// Detaches a listener.  Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.count()
    }

    /// State changes as a channel.
    pub fn subscribe_states(&self) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_state_change(move |change| {
            let _ = tx.send(change.clone());
        });
        rx
    }

    /// Inbound messages as a channel.
    pub fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<InboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_message(move |message| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    /// Failures and retry notices as a channel.
    pub fn subscribe_failures(&self) -> mpsc::UnboundedReceiver<LinkFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_failure(move |failure| {
            let _ = tx.send(failure.clone());
        });
        rx
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    fn transition(&self, core: &mut Core, to: ConnectionState) -> bool {
        let from = core.state;
        if !from.can_transition_to(to) {
            warn!("ignoring illegal transition {from} -> {to}");
            return false;
        }
        core.state = to;
        info!("link {from} -> {to}");
        self.emit(Event::State(StateChange {
            from,
            to,
            endpoint: core.endpoint.clone(),
        }));
        true
    }

    fn reconnect_enabled(&self) -> bool {
        self.inner.config.reconnect && self.inner.config.policy.max_attempts > 0
    }

    fn send_locked(core: &Core, envelope: &MessageEnvelope) -> Result<(), SendError> {
        if core.state != ConnectionState::Connected {
            return Err(SendError::NotConnected { state: core.state });
        }
        let text = encode(envelope)?;
        core.outbound
            .as_ref()
            .ok_or(SendError::TransportGone)?
            .send(Outbound::Text(text))
            .map_err(|_| SendError::TransportGone)
    }

    /// Enters `Connecting` and spawns the handshake task.
    fn begin_attempt(&self, core: &mut Core) {
        core.epoch += 1;
        let epoch = core.epoch;
        let Some(endpoint) = core.endpoint.clone() else {
            return;
        };
        if !self.transition(core, ConnectionState::Connecting) {
            return;
        }

        let manager = self.downgrade();
        let connector = Arc::clone(&self.inner.connector);
        let handshake_timeout = self.inner.config.handshake_timeout;
        let preflight = self.inner.config.preflight_timeout;

        core.attempt_task = Some(tokio::spawn(async move {
            let result = establish(connector.as_ref(), &endpoint, handshake_timeout, preflight).await;
            match manager.upgrade() {
                Some(manager) => manager.on_attempt_finished(epoch, result),
                None => {
                    if let Ok(link) = result {
                        link.close();
                    }
                }
            }
        }));
    }

    fn on_attempt_finished(&self, epoch: u64, result: Result<Link, LinkFailure>) {
        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Connecting {
            if let Ok(link) = result {
                link.close();
            }
            return;
        }
        core.attempt_task = None;

        match result {
            Ok(link) => self.on_open(&mut core, epoch, link),
            Err(failure) => {
                warn!("{failure}");
                self.after_failure(&mut core, failure);
            }
        }
    }

    fn on_open(&self, core: &mut Core, epoch: u64, link: Link) {
        let Link { outbound, inbound } = link;
        core.outbound = Some(outbound);
        core.attempts = 0;
        self.transition(core, ConnectionState::Connected);

        let manager = self.downgrade();
        core.session_task = Some(tokio::spawn(run_session(manager.clone(), epoch, inbound)));
        if let Some(config) = &self.inner.config.heartbeat {
            core.heartbeat = Some(HeartbeatMonitor::start(
                config.clone(),
                SessionHandle { manager, epoch },
            ));
        }
    }

    fn on_link_event(&self, epoch: u64, event: LinkEvent) {
        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Connected {
            return;
        }
        if let Some(heartbeat) = &core.heartbeat {
            heartbeat.record_ack();
        }

        if let LinkEvent::Text(text) = event {
            core.messages_received += 1;
            core.last_message_at = Some(unix_millis());
            let message = decode_inbound(&text);
            if let InboundMessage::Undecoded { error, .. } = &message {
                warn!("undecoded frame from device ({error})");
            }
            self.emit(Event::Message(message));
        }
    }

    fn on_transport_closed(&self, epoch: u64, reason: Option<String>) {
        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Connected {
            return;
        }
        core.close_link(false);
        let Some(endpoint) = core.endpoint.clone() else {
            return;
        };
        let failure = LinkFailure::TransportClosedUnexpectedly { endpoint, reason };
        warn!("{failure}");
        self.after_failure(&mut core, failure);
    }

    /// Called by the heartbeat when the link has been silent too long.
    fn force_close(&self, epoch: u64, missed: u32) {
        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Connected {
            return;
        }
        core.close_link(true);
        let Some(endpoint) = core.endpoint.clone() else {
            return;
        };
        self.after_failure(&mut core, LinkFailure::HeartbeatTimeout { endpoint, missed });
    }

    fn send_for_epoch(&self, epoch: u64, envelope: &MessageEnvelope) -> bool {
        let core = self.lock();
        core.epoch == epoch && Self::send_locked(&core, envelope).is_ok()
    }

    /// Reports `failure` and moves to `Reconnecting`, `Failed` or
    /// `Disconnected`.
    fn after_failure(&self, core: &mut Core, failure: LinkFailure) {
        let from = core.state;
        self.emit(Event::Failure(failure));
        core.epoch += 1;

        if !self.reconnect_enabled() {
            let to = if from == ConnectionState::Connected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Failed
            };
            self.transition(core, to);
            return;
        }

        let policy = self.inner.config.policy;
        if policy.allows_retry(core.attempts) {
            let delay = policy.delay_for(core.attempts);
            core.attempts += 1;
            let attempt = core.attempts;
            let epoch = core.epoch;

            self.transition(core, ConnectionState::Reconnecting);
            info!("reconnect attempt {attempt}/{} in {delay:?}", policy.max_attempts);
            self.emit(Event::Failure(LinkFailure::ReconnectScheduled { attempt, delay }));

            let manager = self.downgrade();
            core.backoff_task = Some(tokio::spawn(async move {
                sleep(delay).await;
                if let Some(manager) = manager.upgrade() {
                    manager.on_backoff_elapsed(epoch);
                }
            }));
        } else {
            let Some(endpoint) = core.endpoint.clone() else {
                return;
            };
            self.transition(core, ConnectionState::Failed);
            warn!("giving up on {endpoint} after {} attempt(s)", core.attempts);
            self.emit(Event::Failure(LinkFailure::MaxReconnectAttemptsExceeded {
                endpoint,
                attempts: core.attempts,
            }));
        }
    }

    fn on_backoff_elapsed(&self, epoch: u64) {
        let mut core = self.lock();
        if core.epoch != epoch || core.state != ConnectionState::Reconnecting {
            return;
        }
        core.backoff_task = None;
        self.begin_attempt(&mut core);
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// One connection attempt: optional pre-flight probe, then the handshake.
async fn establish(
    connector: &dyn Connector,
    endpoint: &DeviceEndpoint,
    handshake_timeout: Duration,
    preflight: Option<Duration>,
) -> Result<Link, LinkFailure> {
    if let Some(limit) = preflight {
        let outcome = probe(connector, endpoint, limit).await;
        if !outcome.is_reachable() {
            return Err(LinkFailure::HandshakeError {
                endpoint: endpoint.clone(),
                reason: format!("pre-flight probe {outcome}"),
            });
        }
    }

    match timeout(handshake_timeout, connector.open(endpoint)).await {
        Ok(Ok(link)) => Ok(link),
        Ok(Err(e)) => Err(LinkFailure::HandshakeError {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        }),
        Err(_elapsed) => Err(LinkFailure::HandshakeTimeout {
            endpoint: endpoint.clone(),
            timeout: handshake_timeout,
        }),
    }
}

/// Forwards inbound link events to the manager until the link closes.
async fn run_session(
    manager: WeakConnectionManager,
    epoch: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(LinkEvent::Closed { reason }) => break reason,
            None => break None,
            Some(event) => match manager.upgrade() {
                Some(manager) => manager.on_link_event(epoch, event),
                None => return,
            },
        }
    };

    if let Some(manager) = manager.upgrade() {
        manager.on_transport_closed(epoch, reason);
    }
}

/// The heartbeat's view of one connected session.
struct SessionHandle {
    manager: WeakConnectionManager,
    epoch: u64,
}

impl LivenessTarget for SessionHandle {
    fn send_probe(&self, probe: &MessageEnvelope) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| manager.send_for_epoch(self.epoch, probe))
    }

    fn request_reconnect(&self, missed: u32) {
        if let Some(manager) = self.manager.upgrade() {
            manager.force_close(self.epoch, missed);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::infrastructure::network::transport::{LinkPeer, TransportError};

    // ── Scripted connector ────────────────────────────────────────────────────

    enum Step {
        Accept,
        Refuse,
        Hang,
    }

    /// Plays `steps` in order (refusing once they run out) and hands the
    /// device side of every accepted link to the test.
    struct ScriptedConnector {
        steps: Mutex<VecDeque<Step>>,
        opens: AtomicUsize,
        peers: mpsc::UnboundedSender<LinkPeer>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn open(&self, endpoint: &DeviceEndpoint) -> Result<Link, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
            match step {
                Step::Accept => {
                    let (link, peer) = Link::pair();
                    let _ = self.peers.send(peer);
                    Ok(link)
                }
                Step::Refuse => Err(TransportError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".into(),
                }),
                Step::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    struct Harness {
        manager: ConnectionManager,
        connector: Arc<ScriptedConnector>,
        peers: mpsc::UnboundedReceiver<LinkPeer>,
        states: mpsc::UnboundedReceiver<StateChange>,
        failures: mpsc::UnboundedReceiver<LinkFailure>,
    }

    impl Harness {
        fn new(config: LinkConfig, steps: Vec<Step>) -> Self {
            let (peers_tx, peers) = mpsc::unbounded_channel();
            let connector = Arc::new(ScriptedConnector {
                steps: Mutex::new(steps.into()),
                opens: AtomicUsize::new(0),
                peers: peers_tx,
            });
            let manager = ConnectionManager::new(connector.clone(), config);
            let states = manager.subscribe_states();
            let failures = manager.subscribe_failures();
            Self {
                manager,
                connector,
                peers,
                states,
                failures,
            }
        }

        fn opens(&self) -> usize {
            self.connector.opens.load(Ordering::SeqCst)
        }

        async fn next_state(&mut self) -> ConnectionState {
            within(self.states.recv()).await.to
        }

        async fn states(&mut self, n: usize) -> Vec<ConnectionState> {
            let mut seen = Vec::with_capacity(n);
            for _ in 0..n {
                seen.push(self.next_state().await);
            }
            seen
        }

        async fn next_failure(&mut self) -> LinkFailure {
            within(self.failures.recv()).await
        }

        async fn next_peer(&mut self) -> LinkPeer {
            within(self.peers.recv()).await
        }
    }

    /// Awaits a channel item, failing the test instead of hanging forever.
    async fn within<T>(fut: impl std::future::Future<Output = Option<T>>) -> T {
        timeout(Duration::from_secs(600), fut)
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    fn quiet_config() -> LinkConfig {
        LinkConfig {
            heartbeat: None,
            ..LinkConfig::default()
        }
    }

    fn device() -> DeviceEndpoint {
        DeviceEndpoint::with_default_port("192.168.1.100")
    }

    use ConnectionState::*;

    // ── Connect ───────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_reports_connecting_then_connected() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Accept]);
        assert_eq!(h.manager.state(), Idle);

        // Act
        h.manager.connect(device());

        // Assert
        assert_eq!(h.states(2).await, vec![Connecting, Connected]);
        assert_eq!(h.manager.endpoint(), Some(device()));
        assert_eq!(h.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_same_endpoint_while_connected_is_noop() {
        let mut h = Harness::new(quiet_config(), vec![Step::Accept, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;

        h.manager.connect(device());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.states.try_recv().is_err());
        assert_eq!(h.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_other_endpoint_disconnects_first() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Accept, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let mut old_peer = h.next_peer().await;
        let other = DeviceEndpoint::with_default_port("192.168.1.101");

        // Act
        h.manager.connect(other.clone());

        // Assert
        assert_eq!(h.states(3).await, vec![Disconnected, Connecting, Connected]);
        assert_eq!(h.manager.endpoint(), Some(other));
        assert_eq!(within(old_peer.outbound.recv()).await, Outbound::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_schedules_one_backoff_then_connects() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Refuse, Step::Accept]);
        let started = tokio::time::Instant::now();

        // Act
        h.manager.connect(device());

        // Assert
        assert_eq!(
            h.states(4).await,
            vec![Connecting, Reconnecting, Connecting, Connected]
        );
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert!(matches!(h.next_failure().await, LinkFailure::HandshakeError { .. }));
        assert_eq!(
            h.next_failure().await,
            LinkFailure::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(h.manager.status().reconnect_attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_is_reported() {
        let config = LinkConfig {
            handshake_timeout: Duration::from_secs(10),
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![Step::Hang, Step::Accept]);

        h.manager.connect(device());

        assert_eq!(
            h.next_failure().await,
            LinkFailure::HandshakeTimeout {
                endpoint: device(),
                timeout: Duration::from_secs(10)
            }
        );
        assert_eq!(
            h.states(4).await,
            vec![Connecting, Reconnecting, Connecting, Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reaches_failed_and_stops() {
        // Arrange
        let config = LinkConfig {
            policy: ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2)
                .unwrap(),
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![]);

        // Act
        h.manager.connect(device());

        // Assert
        assert_eq!(
            h.states(6).await,
            vec![Connecting, Reconnecting, Connecting, Reconnecting, Connecting, Failed]
        );
        // error, scheduled, error, scheduled, error, exhausted
        let mut failures = Vec::new();
        for _ in 0..6 {
            failures.push(h.next_failure().await);
        }
        assert_eq!(
            failures[5],
            LinkFailure::MaxReconnectAttemptsExceeded {
                endpoint: device(),
                attempts: 2
            }
        );
        assert_eq!(
            failures[3],
            LinkFailure::ReconnectScheduled {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.opens(), 3);
        assert_eq!(h.manager.state(), Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_with_reconnect_disabled_is_reported_as_failed() {
        let config = LinkConfig {
            reconnect: false,
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![Step::Refuse]);

        h.manager.connect(device());

        assert_eq!(h.states(2).await, vec![Connecting, Failed]);
        assert!(matches!(h.next_failure().await, LinkFailure::HandshakeError { .. }));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_manager_rearms_on_explicit_connect() {
        let config = LinkConfig {
            reconnect: false,
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![Step::Refuse, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;

        h.manager.connect(device());

        assert_eq!(h.states(2).await, vec![Connecting, Connected]);
    }

    // ── Remote close ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_reconnects_after_base_delay() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Accept, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let peer = h.next_peer().await;

        // Act
        let closed_at = tokio::time::Instant::now();
        peer.inbound
            .send(LinkEvent::Closed {
                reason: Some("going away".into()),
            })
            .unwrap();

        // Assert
        assert_eq!(h.states(3).await, vec![Reconnecting, Connecting, Connected]);
        assert_eq!(closed_at.elapsed(), Duration::from_millis(1000));
        assert_eq!(
            h.next_failure().await,
            LinkFailure::TransportClosedUnexpectedly {
                endpoint: device(),
                reason: Some("going away".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_with_reconnect_disabled_goes_disconnected() {
        let config = LinkConfig {
            reconnect: false,
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let peer = h.next_peer().await;

        drop(peer);

        assert_eq!(h.next_state().await, Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.opens(), 1);
    }

    // ── Disconnect ────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_backoff() {
        // Arrange: first attempt fails, so a retry timer is armed.
        let mut h = Harness::new(quiet_config(), vec![Step::Refuse, Step::Accept]);
        h.manager.connect(device());
        assert_eq!(h.states(2).await, vec![Connecting, Reconnecting]);

        // Act
        h.manager.disconnect();

        // Assert
        assert_eq!(h.next_state().await, Disconnected);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opens(), 1);
        assert_eq!(h.manager.state(), Disconnected);
        assert!(h.states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_reconnecting_rearms_immediately() {
        // Arrange: first attempt fails, so a retry timer is armed.
        let mut h = Harness::new(quiet_config(), vec![Step::Refuse, Step::Accept]);
        h.manager.connect(device());
        assert_eq!(h.states(2).await, vec![Connecting, Reconnecting]);
        let armed_at = tokio::time::Instant::now();

        // Act
        h.manager.connect(device());

        // Assert: no backoff wait, the counter is reset.
        assert_eq!(h.states(2).await, vec![Connecting, Connected]);
        assert_eq!(armed_at.elapsed(), Duration::ZERO);
        assert_eq!(h.opens(), 2);
        assert_eq!(h.manager.status().reconnect_attempt, 0);

        // The cancelled timer must not start another attempt.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opens(), 2);
        assert_eq!(h.manager.state(), Connected);
        assert!(h.states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_transport_without_reconnect() {
        let mut h = Harness::new(quiet_config(), vec![Step::Accept, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let mut peer = h.next_peer().await;

        h.manager.disconnect();
        // A late close from the transport must not revive the link.
        let _ = peer.inbound.send(LinkEvent::Closed { reason: None });

        assert_eq!(h.next_state().await, Disconnected);
        assert_eq!(within(peer.outbound.recv()).await, Outbound::Close);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.opens(), 1);
        assert!(h.states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_twice_emits_once() {
        let mut h = Harness::new(quiet_config(), vec![]);

        h.manager.disconnect();
        h.manager.disconnect();

        assert_eq!(h.next_state().await, Disconnected);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.states.try_recv().is_err());
    }

    // ── Send / receive ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_send_rejected_unless_connected() {
        let h = Harness::new(quiet_config(), vec![]);

        let result = h.manager.send(&MessageEnvelope::get_all_data());

        assert_eq!(result, Err(SendError::NotConnected { state: Idle }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_writes_encoded_text_when_connected() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let mut peer = h.next_peer().await;

        // Act
        assert_ok!(h.manager.send(&MessageEnvelope::motor(1, true)));

        // Assert
        assert_eq!(
            within(peer.outbound.recv()).await,
            Outbound::Text(r#"{"type":"motor1On"}"#.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejects_reserved_payload_field() {
        let mut h = Harness::new(quiet_config(), vec![Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;

        let bad = MessageEnvelope::new("updateSettings").field("type", "x");

        assert_err!(h.manager.send(&bad));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_are_delivered_in_order() {
        // Arrange
        let mut h = Harness::new(quiet_config(), vec![Step::Accept]);
        let mut messages = h.manager.subscribe_messages();
        h.manager.connect(device());
        h.states(2).await;
        let peer = h.next_peer().await;

        // Act
        for frame in [r#"{"type":"settingData","a":1}"#, "not json", r#"{"type":"getAllData"}"#] {
            peer.inbound.send(LinkEvent::Text(frame.into())).unwrap();
        }

        // Assert
        let first = within(messages.recv()).await;
        let second = within(messages.recv()).await;
        let third = within(messages.recv()).await;
        assert_eq!(first.envelope().map(|e| e.kind.as_str()), Some("settingData"));
        assert!(second.is_undecoded());
        assert_eq!(third.envelope().map(|e| e.kind.as_str()), Some("getAllData"));

        let status = h.manager.status();
        assert_eq!(status.messages_received, 3);
        assert!(status.last_message_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_listener_receives_nothing() {
        let mut h = Harness::new(quiet_config(), vec![Step::Accept]);
        let calls = Arc::new(AtomicUsize::new(0));
        let id = {
            let calls = Arc::clone(&calls);
            h.manager.on_state_change(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        // The harness holds the state and failure subscriptions.
        assert_eq!(h.manager.listener_count(), 3);

        assert!(h.manager.remove_listener(id));
        assert!(!h.manager.remove_listener(id));
        h.manager.connect(device());
        h.states(2).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.manager.listener_count(), 2);
    }

    // ── Heartbeat / pre-flight ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_is_force_closed_by_heartbeat() {
        // Arrange
        let config = LinkConfig {
            heartbeat: Some(HeartbeatConfig {
                interval: Duration::from_secs(5),
                grace: Duration::from_secs(2),
                miss_threshold: 2,
                probe: MessageEnvelope::system_status_text(),
            }),
            ..LinkConfig::default()
        };
        let mut h = Harness::new(config, vec![Step::Accept, Step::Accept]);
        h.manager.connect(device());
        h.states(2).await;
        let mut peer = h.next_peer().await;

        // Act: the device never answers.
        let failure = h.next_failure().await;

        // Assert
        assert_eq!(
            failure,
            LinkFailure::HeartbeatTimeout {
                endpoint: device(),
                missed: 2
            }
        );
        assert_eq!(h.states(3).await, vec![Reconnecting, Connecting, Connected]);
        assert_eq!(
            within(peer.outbound.recv()).await,
            Outbound::Text(r#"{"type":"getSystemStatusText"}"#.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_preflight_failure_counts_as_handshake_error() {
        let config = LinkConfig {
            preflight_timeout: Some(Duration::from_secs(5)),
            reconnect: false,
            ..quiet_config()
        };
        let mut h = Harness::new(config, vec![Step::Refuse, Step::Accept]);

        h.manager.connect(device());

        assert_eq!(h.states(2).await, vec![Connecting, Failed]);
        match h.next_failure().await {
            LinkFailure::HandshakeError { reason, .. } => assert!(reason.contains("pre-flight")),
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(h.opens(), 1);
    }
}
