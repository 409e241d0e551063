//! JSON codec for [`MessageEnvelope`]s.
//!
//! Wire format: one UTF-8 JSON object per WebSocket text frame.
//! ```text
//! {"type":"<kind>", <payload fields>...}
//! ```
//!
//! Decoding is deliberately forgiving at the *transport* level: a frame that
//! is not a valid envelope is not an error for the link.  Use
//! [`decode_inbound`] to classify a frame; it always yields something a
//! listener can display.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::envelope::MessageEnvelope;

/// Errors that can occur while encoding or decoding envelopes.
///
/// The variants carry rendered messages instead of `serde_json::Error` so the
/// error stays `Clone` and can travel inside [`InboundMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The text is not valid JSON.
    #[error("malformed JSON: {0}")]
    Malformed(String),

    /// The text is valid JSON but not an object (e.g. a bare string or array).
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The object has no `type` field, or it is not a non-empty string.
    #[error("missing or invalid \"type\" field")]
    MissingType,

    /// The payload map contains a key that collides with the envelope's own fields.
    #[error("payload must not contain the reserved field \"{0}\"")]
    ReservedField(&'static str),

    /// Serialization failed.
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),
}

/// An inbound frame after classification.
///
/// Typed dispatch only looks at [`InboundMessage::Envelope`]; diagnostic
/// consumers (a console view, a log) also get the undecoded text.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// The frame decoded into an envelope.
    Envelope(MessageEnvelope),
    /// The frame could not be decoded; `raw` is the text exactly as received.
    Undecoded { raw: String, error: CodecError },
}

impl InboundMessage {
    /// Returns the decoded envelope, if any.
    pub fn envelope(&self) -> Option<&MessageEnvelope> {
        match self {
            InboundMessage::Envelope(env) => Some(env),
            InboundMessage::Undecoded { .. } => None,
        }
    }

    /// Returns `true` for frames that failed to decode.
    pub fn is_undecoded(&self) -> bool {
        matches!(self, InboundMessage::Undecoded { .. })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes an envelope to JSON text.
///
/// # Errors
///
/// Returns [`CodecError::MissingType`] if the kind is empty,
/// [`CodecError::ReservedField`] if the payload contains a `type` key, and
/// [`CodecError::Serialize`] if a payload value cannot be rendered.
///
/// # Examples
///
/// ```rust
/// use tank_core::{decode, encode, MessageEnvelope};
///
/// let env = MessageEnvelope::new("motor1On");
/// let text = encode(&env).unwrap();
/// assert_eq!(text, r#"{"type":"motor1On"}"#);
/// assert_eq!(decode(&text).unwrap(), env);
/// ```
pub fn encode(envelope: &MessageEnvelope) -> Result<String, CodecError> {
    if envelope.kind.is_empty() {
        return Err(CodecError::MissingType);
    }
    if envelope.payload.contains_key("type") {
        return Err(CodecError::ReservedField("type"));
    }
    serde_json::to_string(envelope).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// Decodes JSON text into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for invalid JSON,
/// [`CodecError::NotAnObject`] for non-object JSON, and
/// [`CodecError::MissingType`] when `type` is absent, empty, or not a string.
pub fn decode(text: &str) -> Result<MessageEnvelope, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let mut object = match value {
        Value::Object(map) => map,
        other => return Err(CodecError::NotAnObject(json_kind(&other))),
    };

    let kind = match object.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind,
        _ => return Err(CodecError::MissingType),
    };

    Ok(MessageEnvelope {
        kind,
        payload: object,
    })
}

/// Classifies an inbound text frame.
///
/// Never fails: frames that do not decode come back as
/// [`InboundMessage::Undecoded`] with the original text.
pub fn decode_inbound(text: &str) -> InboundMessage {
    match decode(text) {
        Ok(env) => InboundMessage::Envelope(env),
        Err(error) => {
            tracing::debug!("undecoded frame ({error}): {text}");
            InboundMessage::Undecoded {
                raw: text.to_string(),
                error,
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
