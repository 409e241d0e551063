//! Integration tests for the tank-core JSON codec.
//!
//! These tests push representative controller messages through the public
//! API and check that `decode(encode(envelope)) == envelope`, plus the
//! classification of frames the firmware sends that are not envelopes.

use serde_json::{json, Map, Value};
use tank_core::{decode, decode_inbound, encode, message_types, CodecError, InboundMessage, MessageEnvelope};

/// Encodes an envelope and decodes it again.
fn roundtrip(env: &MessageEnvelope) -> MessageEnvelope {
    let text = encode(env).expect("encode must succeed");
    decode(&text).expect("decode must succeed")
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[test]
fn test_roundtrip_command_without_payload() {
    for kind in [
        message_types::HANDSHAKE,
        message_types::GET_ALL_DATA,
        message_types::GET_SYSTEM_STATUS_TEXT,
        message_types::MOTOR1_ON,
        message_types::MOTOR1_OFF,
        message_types::MOTOR2_ON,
        message_types::MOTOR2_OFF,
    ] {
        let original = MessageEnvelope::new(kind);
        assert_eq!(original, roundtrip(&original), "kind={kind}");
    }
}

#[test]
fn test_roundtrip_update_settings_with_mixed_values() {
    let original = MessageEnvelope::update_settings(object(json!({
        "minLevel": 20,
        "maxLevel": 95,
        "autoMode": true,
        "tankName": "Roof tank",
        "calibration": {"empty": 180.5, "full": 12.0},
        "schedule": [6, 18],
        "note": null
    })));

    assert_eq!(original, roundtrip(&original));
}

#[test]
fn test_roundtrip_all_data_report() {
    // Shape of a typical controller report: nested topology and per-tank levels.
    let original = MessageEnvelope::with_payload(
        message_types::GET_ALL_DATA,
        object(json!({
            "tanks": [
                {"id": 1, "level": 72, "motor": "on"},
                {"id": 2, "level": 15, "motor": "off"}
            ],
            "uptime": 86_400,
            "rssi": -61
        })),
    );

    assert_eq!(original, roundtrip(&original));
}

#[test]
fn test_roundtrip_unicode_strings() {
    let original = MessageEnvelope::new(message_types::SETTING_DATA).field("label", "टंकी ✓");
    assert_eq!(original, roundtrip(&original));
}

#[test]
fn test_decode_ignores_field_order_and_whitespace() {
    let text = r#"  { "level" : 42 , "type" : "getAllData" }  "#;

    let env = decode(text).unwrap();

    assert_eq!(env, MessageEnvelope::get_all_data().field("level", 42));
}

#[test]
fn test_inbound_classification_of_non_envelopes() {
    let cases: [(&str, fn(&CodecError) -> bool); 4] = [
        ("System OK", |e| matches!(e, CodecError::Malformed(_))),
        ("\"just a string\"", |e| matches!(e, CodecError::NotAnObject(_))),
        (r#"{"level":1}"#, |e| *e == CodecError::MissingType),
        (r#"{"type":null}"#, |e| *e == CodecError::MissingType),
    ];

    for (raw, expected) in cases {
        match decode_inbound(raw) {
            InboundMessage::Undecoded { raw: kept, error } => {
                assert_eq!(kept, raw);
                assert!(expected(&error), "unexpected error {error:?} for {raw}");
            }
            other => panic!("expected Undecoded for {raw}, got {other:?}"),
        }
    }
}
