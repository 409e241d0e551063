//! SyncCoordinator: the consumer-facing API of tank-link.
//!
//! The UI never touches sockets, timers, or the state machine directly.  It
//! holds one `SyncCoordinator` and:
//!
//! - calls `connect(host)` / `disconnect()` / `send(msg)` / `manual_sync()`,
//! - reads `status()` for a serializable snapshot,
//! - registers typed envelope listeners with `on_envelope`,
//! - runs discovery through `quick_scan` / `range_scan`, or simply `resume()`
//!   to reconnect to the device used last time.
//!
//! Every time the link enters `Connected` the coordinator saves the endpoint
//! to the injected [`DeviceStore`] on Tokio's blocking pool (listeners share
//! one dispatcher task) and, when `sync_on_connect` is set, sends
//! `handshake` followed by `getAllData` so the UI gets a full picture
//! without asking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tank_core::{ConnectionState, DeviceEndpoint, EndpointError, MessageEnvelope, DEFAULT_PORT};

use crate::infrastructure::network::{
    ConnectionManager, Connector, LinkConfig, LinkStatus, ListenerId, NetworkPrefix,
    NetworkScanner, ScanCancel, ScanConfig, ScanError, ScanProgress, ScanResult, SendError,
};
use crate::infrastructure::storage::{AppConfig, ConfigError, DeviceStore, StoreError};

/// Coordinator behaviour that is not owned by the manager or the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Port used when `connect` gets a bare host.
    pub port: u16,
    /// Send `handshake` + `getAllData` on every entry into `Connected`.
    pub sync_on_connect: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            sync_on_connect: true,
        }
    }
}

/// Facade over the connection manager, scanner and device store.
pub struct SyncCoordinator {
    manager: ConnectionManager,
    scanner: NetworkScanner,
    store: Arc<dyn DeviceStore>,
    options: CoordinatorOptions,
}

impl SyncCoordinator {
    /// Builds a coordinator.  Must be called inside a Tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        link: LinkConfig,
        scan: ScanConfig,
        store: Arc<dyn DeviceStore>,
        options: CoordinatorOptions,
    ) -> Self {
        let manager = ConnectionManager::new(Arc::clone(&connector), link);
        let scanner = NetworkScanner::new(connector, scan);

        let weak = manager.downgrade();
        let on_connected_store = Arc::clone(&store);
        manager.on_state_change(move |change| {
            if change.to != ConnectionState::Connected {
                return;
            }
            if let Some(endpoint) = change.endpoint.clone() {
                let store = Arc::clone(&on_connected_store);
                tokio::task::spawn_blocking(move || match store.save(&endpoint) {
                    Ok(()) => debug!("remembered {endpoint} as last device"),
                    Err(e) => warn!("could not remember {endpoint}: {e}"),
                });
            }
            if options.sync_on_connect {
                if let Some(manager) = weak.upgrade() {
                    initial_sync(&manager);
                }
            }
        });

        Self {
            manager,
            scanner,
            store,
            options,
        }
    }

    /// Builds a coordinator from the configuration file's values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Policy`] if the reconnect settings are invalid.
    pub fn from_config(
        connector: Arc<dyn Connector>,
        config: &AppConfig,
        store: Arc<dyn DeviceStore>,
    ) -> Result<Self, ConfigError> {
        let options = CoordinatorOptions {
            port: config.device.port,
            sync_on_connect: config.device.sync_on_connect,
        };
        Ok(Self::new(
            connector,
            config.link_config()?,
            config.scan_config(),
            store,
            options,
        ))
    }

    /// The underlying manager, for raw state/message/failure subscriptions.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    // ── Link commands ─────────────────────────────────────────────────────────

    /// Connects to `host` (`"192.168.1.100"`, `"tank.local:8081"`, or a
    /// `ws://` URL).  A bare host gets the configured port.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if `host` does not parse.  Connection
    /// failures are reported asynchronously, never here.
    pub fn connect(&self, host: &str) -> Result<DeviceEndpoint, EndpointError> {
        let endpoint = DeviceEndpoint::parse_with_port(host, self.options.port)?;
        self.connect_endpoint(endpoint.clone());
        Ok(endpoint)
    }

    pub fn connect_endpoint(&self, endpoint: DeviceEndpoint) {
        info!("connecting to {endpoint}");
        self.manager.connect(endpoint);
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    /// Fire-and-forget send.  Fails fast unless `Connected`.
    pub fn send(&self, envelope: &MessageEnvelope) -> Result<(), SendError> {
        self.manager.send(envelope)
    }

    /// Requests a full data refresh (`getAllData`).
    pub fn manual_sync(&self) -> Result<(), SendError> {
        self.manager.send(&MessageEnvelope::get_all_data())
    }

    pub fn status(&self) -> LinkStatus {
        self.manager.status()
    }

    /// Reconnects to the stored last device, if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn resume(&self) -> Result<Option<DeviceEndpoint>, StoreError> {
        let last = self.store.load()?;
        match &last {
            Some(endpoint) => self.connect_endpoint(endpoint.clone()),
            None => debug!("no last device stored"),
        }
        Ok(last)
    }

    /// Registers a listener for successfully decoded envelopes only.
    ///
    /// Undecoded frames are still visible through
    /// [`ConnectionManager::on_message`].
    pub fn on_envelope<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.manager.on_message(move |message| {
            if let Some(envelope) = message.envelope() {
                listener(envelope);
            }
        })
    }

    /// Like [`Self::on_envelope`], restricted to one message type.
    pub fn on_message_type<F>(&self, kind: &str, listener: F) -> ListenerId
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        let kind = kind.to_string();
        self.on_envelope(move |envelope| {
            if envelope.is(&kind) {
                listener(envelope);
            }
        })
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.manager.remove_listener(id)
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Probes the quick-scan candidates, the stored last device first.
    pub async fn quick_scan(&self, cancel: &ScanCancel) -> ScanResult {
        let last = match self.store.load() {
            Ok(last) => last,
            Err(e) => {
                warn!("ignoring unreadable last device: {e}");
                None
            }
        };
        self.scanner.quick_scan(last.as_ref(), cancel).await
    }

    /// Probes every host of the `/24` given as `prefix` (e.g. `"192.168.1"`).
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::InvalidPrefix`] if `prefix` does not parse.
    pub async fn range_scan(
        &self,
        prefix: &str,
        cancel: &ScanCancel,
        progress: Option<&mpsc::UnboundedSender<ScanProgress>>,
    ) -> Result<ScanResult, ScanError> {
        let prefix: NetworkPrefix = prefix.parse()?;
        Ok(self.scanner.range_scan(&prefix, cancel, progress).await)
    }

    /// Reconnects to the stored device, or quick-scans and connects to the
    /// first device that answers.  Returns the endpoint being connected to.
    pub async fn auto_connect(&self, cancel: &ScanCancel) -> Option<DeviceEndpoint> {
        match self.resume() {
            Ok(Some(endpoint)) => return Some(endpoint),
            Ok(None) => {}
            Err(e) => warn!("ignoring unreadable last device: {e}"),
        }

        let found = self.scanner.quick_scan(None, cancel).await;
        let endpoint = found.first().cloned()?;
        self.connect_endpoint(endpoint.clone());
        Some(endpoint)
    }
}

/// Sends the greeting and the full-state request.
fn initial_sync(manager: &ConnectionManager) {
    for envelope in [MessageEnvelope::handshake(), MessageEnvelope::get_all_data()] {
        if let Err(e) = manager.send(&envelope) {
            debug!("initial sync skipped: {e}");
            return;
        }
    }
    debug!("initial sync requested");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
