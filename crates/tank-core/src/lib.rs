//! # tank-core
//!
//! Shared library for TankLink containing the JSON message envelope and codec
//! plus the pure domain types that describe a link to a water-tank controller.
//!
//! This crate has zero dependencies on sockets, timers, or an async runtime.
//!
//! # Architecture overview (for beginners)
//!
//! The water-tank controller is an ESP32-class device on the local network.
//! It exposes a WebSocket server on port 81 that speaks small JSON objects,
//! each tagged with a `"type"` field (`getAllData`, `motor1On`, ...).
//!
//! This crate is the shared foundation for everything that talks to it:
//!
//! - **`protocol`** – How messages look on the wire.  A [`MessageEnvelope`]
//!   is encoded to JSON text and decoded back; text that fails to decode is
//!   still surfaced as an [`InboundMessage::Undecoded`] so diagnostic
//!   consumers can show it.
//!
//! - **`domain`** – Pure connection vocabulary: where the device lives
//!   ([`DeviceEndpoint`]), what state the link is in ([`ConnectionState`]),
//!   how long to wait between reconnects ([`ReconnectPolicy`]), and the
//!   bookkeeping for liveness checks ([`HeartbeatState`]).

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `tank_core::MessageEnvelope` instead of the full module path.
pub use domain::endpoint::{DeviceEndpoint, EndpointError, DEFAULT_PORT};
pub use domain::heartbeat::HeartbeatState;
pub use domain::policy::{PolicyError, ReconnectPolicy};
pub use domain::state::ConnectionState;
pub use protocol::codec::{decode, decode_inbound, encode, CodecError, InboundMessage};
pub use protocol::envelope::{message_types, MessageEnvelope};
