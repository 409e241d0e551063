//! Application layer.
//!
//! - **`sync_coordinator`** – The one object a UI talks to.  It wires the
//!   connection manager, scanner and last-device store together, performs
//!   the initial data sync whenever the link comes up, and exposes a small
//!   command surface (`connect`, `disconnect`, `send`, `manual_sync`) plus a
//!   status snapshot.

pub mod sync_coordinator;

pub use sync_coordinator::{CoordinatorOptions, SyncCoordinator};
