//! Wire protocol for the controller's WebSocket.
//!
//! Every frame is a UTF-8 JSON object carrying a mandatory `"type"` string.
//! The remaining fields form the type-specific payload.

pub mod codec;
pub mod envelope;

pub use codec::{decode, decode_inbound, encode, CodecError, InboundMessage};
pub use envelope::{message_types, MessageEnvelope};
