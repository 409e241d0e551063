//! tank-link library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does tank-link do? (for beginners)
//!
//! A water-tank controller (an ESP32 on the home Wi-Fi) serves a JSON
//! WebSocket on port 81.  Wi-Fi links drop, the controller reboots, and its
//! DHCP address changes.  This crate is the piece that copes with all that:
//!
//! 1. **Find** the controller: probe a short candidate list, or sweep a whole
//!    `/24` in bounded batches (`infrastructure::network::scanner`).
//! 2. **Connect** and stay connected: a single state machine with
//!    exponential backoff (`infrastructure::network::connection_manager`).
//! 3. **Notice** a silently dead link: periodic probes with a grace window
//!    (`infrastructure::network::heartbeat`).
//! 4. **Expose** a small API to the UI: `connect`, `disconnect`, `send`,
//!    `manual_sync`, and a status snapshot (`application::sync_coordinator`).

/// Application layer: the consumer-facing coordinator.
pub mod application;

/// Infrastructure layer: sockets, timers, and file storage.
pub mod infrastructure;
