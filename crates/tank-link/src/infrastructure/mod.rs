//! Infrastructure layer for tank-link.
//!
//! Contains the OS-facing adapters: WebSocket transport, probing and
//! scanning, the connection state machine, and file-system storage.
//!
//! **Dependency rule**: this layer may depend on `tank_core`, but MUST NOT
//! import from `application`.

pub mod network;
pub mod storage;
