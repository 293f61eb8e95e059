use super::*;

fn sample_frame() -> PushFrame {
    PushFrame {
        id: Some("evt-1".to_owned()),
        ts: 1_700_000_000_000,
        scope_id: Some("org-1".to_owned()),
        kind: "messageReceived".to_owned(),
        data: serde_json::json!({
            "message": {"id": "m1", "content": "hi", "timestamp": 100.0},
            "conversation": {"id": "c1"},
            "flag": true,
            "nil": null
        }),
    }
}

#[test]
fn binary_encode_decode_preserves_frame() {
    let frame = sample_frame();
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode should succeed");
    assert_eq!(decoded, frame);
}

#[test]
fn decode_frame_rejects_malformed_bytes() {
    let err = decode_frame(&[0xff, 0x00, 0x01]).expect_err("bytes should fail");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn decode_frame_defaults_missing_data_to_empty_object() {
    let wire = WireFrame {
        id: None,
        ts: 1,
        scope_id: None,
        kind: "connected".to_owned(),
        data: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");

    let frame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.kind, "connected");
    assert_eq!(frame.data, serde_json::json!({}));
}

#[test]
fn decode_frame_converts_nan_number_to_json_null() {
    let wire = WireFrame {
        id: None,
        ts: 1,
        scope_id: None,
        kind: "countersUpdated".to_owned(),
        data: Some(prost_types::Value {
            kind: Some(prost_types::value::Kind::NumberValue(f64::NAN)),
        }),
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");

    let frame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.data, Value::Null);
}

#[test]
fn binary_path_normalizes_integers_to_floats() {
    let frame = PushFrame::new("countersUpdated", serde_json::json!({"unread": 2}));
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    assert_eq!(decoded.data.get("unread"), Some(&serde_json::json!(2.0)));
}

#[test]
fn decode_text_reads_type_and_data() {
    let frame = decode_text(r#"{"type":"conversationUpdated","data":{"conversation_id":"c1"}}"#)
        .expect("decode");
    assert_eq!(frame.kind, "conversationUpdated");
    assert_eq!(frame.data, serde_json::json!({"conversation_id": "c1"}));
    assert!(frame.id.is_none());
    assert_eq!(frame.ts, 0);
}

#[test]
fn decode_text_falls_back_to_event_key() {
    let frame = decode_text(r#"{"event":"connected"}"#).expect("decode");
    assert_eq!(frame.kind, "connected");
    assert_eq!(frame.data, serde_json::json!({}));
}

#[test]
fn decode_text_stringifies_numeric_ids_and_reads_float_ts() {
    let frame = decode_text(r#"{"type":"x","id":42,"ts":1500.0,"scopeId":"org-9"}"#).expect("decode");
    assert_eq!(frame.id.as_deref(), Some("42"));
    assert_eq!(frame.ts, 1500);
    assert_eq!(frame.scope_id.as_deref(), Some("org-9"));
}

#[test]
fn decode_text_rejects_missing_kind() {
    let err = decode_text(r#"{"data":{}}"#).expect_err("kind required");
    assert!(matches!(err, CodecError::MissingKind));
}

#[test]
fn decode_text_rejects_non_object_and_invalid_json() {
    assert!(matches!(decode_text("[1,2]"), Err(CodecError::NotAnObject)));
    assert!(matches!(decode_text("{not json"), Err(CodecError::Json(_))));
}

#[test]
fn text_envelope_survives_encode_then_decode() {
    let frame = sample_frame();
    let decoded = decode_text(&encode_text(&frame)).expect("decode");
    assert_eq!(decoded, frame);
}

#[test]
fn builders_set_optional_fields() {
    let frame = PushFrame::new("close", serde_json::json!({}))
        .with_id("e-1")
        .with_scope("org-1")
        .with_ts(9);
    assert_eq!(frame.id.as_deref(), Some("e-1"));
    assert_eq!(frame.scope_id.as_deref(), Some("org-1"));
    assert_eq!(frame.ts, 9);
}
