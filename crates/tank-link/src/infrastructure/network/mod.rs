//! Network infrastructure.
//!
//! # Sub-modules
//!
//! - **`transport`** – The [`Connector`] seam and the tokio-tungstenite
//!   implementation.  Everything above it talks to a [`Link`]: an outbound
//!   sender and an inbound receiver, so tests can script the device.
//!
//! - **`probe`** – One timeout-bounded "does a WebSocket answer here?" check.
//!
//! - **`scanner`** – Runs probes over a candidate list or a whole `/24` in
//!   fixed-size batches.
//!
//! - **`events`** – Typed listener registries and the ordered dispatcher.
//!
//! - **`connection_manager`** – The reconnection state machine that owns the
//!   single active link.
//!
//! - **`heartbeat`** – Periodic liveness probes that force a reconnect when
//!   the link goes quiet.

pub mod connection_manager;
pub mod events;
pub mod heartbeat;
pub mod probe;
pub mod scanner;
pub mod transport;

pub use connection_manager::{
    ConnectionManager, LinkConfig, LinkStatus, SendError, WeakConnectionManager,
};
pub use events::{LinkFailure, ListenerId, StateChange};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, LivenessTarget};
pub use probe::{probe, ProbeOutcome};
pub use scanner::{
    NetworkPrefix, NetworkScanner, ScanCancel, ScanConfig, ScanError, ScanProgress, ScanResult,
};
pub use transport::{Connector, Link, LinkEvent, LinkPeer, Outbound, TransportError, WsConnector};
