//! The `{type, payload}` message envelope shared by both directions.
//!
//! # JSON discriminant
//!
//! The envelope is *flat* on the wire: the payload fields sit next to the
//! `"type"` field in the same object.
//!
//! ```json
//! {"type":"getAllData"}
//! {"type":"updateSettings","minLevel":20,"maxLevel":95}
//! ```
//!
//! Serde's `#[serde(flatten)]` on the payload map produces exactly this
//! shape.  Because `type` is the dispatch key, the payload map itself may not
//! contain a `type` entry; [`crate::protocol::codec::encode`] rejects such
//! envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message types observed on the controller link.
///
/// The set is defined by the device firmware, not by this crate, so the
/// envelope keeps `type` as a free-form string.  These constants only spare
/// callers from repeating string literals.
pub mod message_types {
    /// Greeting sent right after the WebSocket opens.
    pub const HANDSHAKE: &str = "handshake";
    /// Requests a full state dump (levels, motors, topology).
    pub const GET_ALL_DATA: &str = "getAllData";
    /// Requests the human-readable system status line.
    pub const GET_SYSTEM_STATUS_TEXT: &str = "getSystemStatusText";
    /// Pushes new settings to the controller.
    pub const UPDATE_SETTINGS: &str = "updateSettings";
    /// Settings snapshot reported by the controller.
    pub const SETTING_DATA: &str = "settingData";
    pub const MOTOR1_ON: &str = "motor1On";
    pub const MOTOR1_OFF: &str = "motor1Off";
    pub const MOTOR2_ON: &str = "motor2On";
    pub const MOTOR2_OFF: &str = "motor2Off";
}

/// A single message exchanged with the controller.
///
/// Outbound commands and inbound reports share this shape; `kind` (the
/// `"type"` field on the wire) is the dispatch key.
///
/// # Example
///
/// ```rust
/// use tank_core::MessageEnvelope;
///
/// let env = MessageEnvelope::motor(1, true);
/// assert_eq!(env.kind, "motor1On");
/// assert!(env.payload.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// The message type, serialized as `"type"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific fields, flattened into the same JSON object.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl MessageEnvelope {
    /// Creates an envelope with the given type and an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Creates an envelope with the given type and payload.
    pub fn with_payload(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Adds one payload field, builder style.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// `{"type":"handshake"}`
    pub fn handshake() -> Self {
        Self::new(message_types::HANDSHAKE)
    }

    /// `{"type":"getAllData"}`
    pub fn get_all_data() -> Self {
        Self::new(message_types::GET_ALL_DATA)
    }

    /// `{"type":"getSystemStatusText"}`
    pub fn system_status_text() -> Self {
        Self::new(message_types::GET_SYSTEM_STATUS_TEXT)
    }

    /// `{"type":"updateSettings", ...settings}`
    pub fn update_settings(settings: Map<String, Value>) -> Self {
        Self::with_payload(message_types::UPDATE_SETTINGS, settings)
    }

    /// Builds a motor switch command such as `motor2Off`.
    ///
    /// `index` is the 1-based motor number as labelled on the controller.
    pub fn motor(index: u8, on: bool) -> Self {
        let state = if on { "On" } else { "Off" };
        Self::new(format!("motor{index}{state}"))
    }

    /// Returns `true` if this envelope is of the given type.
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
