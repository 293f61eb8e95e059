//! Push-event envelope and codecs for the live conversation stream.
//!
//! The server pushes one envelope per event. Text messages carry JSON
//! (`{"type": "messageReceived", "data": {...}}`); binary messages carry the
//! same envelope encoded as protobuf. Payloads stay schemaless
//! (`serde_json::Value`) on both paths; typing them is the dispatcher's job.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by [`decode_frame`] and [`decode_text`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The text payload was not valid JSON.
    #[error("failed to parse json envelope: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON envelope was valid but not an object.
    #[error("json envelope is not an object")]
    NotAnObject,
    /// Neither `type` nor `event` named the event kind.
    #[error("envelope has no event type")]
    MissingKind,
}

/// One server-pushed event, before its payload is typed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    /// Server-assigned event id, used for duplicate suppression when present.
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch when the server emitted the event (0 if unknown).
    pub ts: i64,
    /// Top-level scope (organization) the event belongs to.
    pub scope_id: Option<String>,
    /// Event discriminator, e.g. `"messageReceived"`.
    pub kind: String,
    /// Event payload.
    pub data: Value,
}

impl PushFrame {
    /// Build a frame with no id, scope, or timestamp.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { id: None, ts: 0, scope_id: None, kind: kind.into(), data }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    #[must_use]
    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }
}

// =============================================================================
// BINARY (PROTOBUF)
// =============================================================================

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &PushFrame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<PushFrame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    Ok(wire_to_frame(wire))
}

fn frame_to_wire(frame: &PushFrame) -> WireFrame {
    WireFrame {
        id: frame.id.clone(),
        ts: frame.ts,
        scope_id: frame.scope_id.clone(),
        kind: frame.kind.clone(),
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> PushFrame {
    PushFrame {
        id: wire.id,
        ts: wire.ts,
        scope_id: wire.scope_id,
        kind: wire.kind,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    }
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => {
            serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number)
        }
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, optional, tag = "1")]
    id: Option<String>,
    #[prost(int64, tag = "2")]
    ts: i64,
    #[prost(string, optional, tag = "3")]
    scope_id: Option<String>,
    #[prost(string, tag = "4")]
    kind: String,
    #[prost(message, optional, tag = "5")]
    data: Option<prost_types::Value>,
}

// =============================================================================
// TEXT (JSON)
// =============================================================================

/// Encode a frame as a JSON text envelope.
#[must_use]
pub fn encode_text(frame: &PushFrame) -> String {
    let mut envelope = Map::new();
    envelope.insert("type".into(), Value::String(frame.kind.clone()));
    envelope.insert("data".into(), frame.data.clone());
    if let Some(id) = &frame.id {
        envelope.insert("id".into(), Value::String(id.clone()));
    }
    if let Some(scope_id) = &frame.scope_id {
        envelope.insert("scope_id".into(), Value::String(scope_id.clone()));
    }
    if frame.ts != 0 {
        envelope.insert("ts".into(), Value::from(frame.ts));
    }
    Value::Object(envelope).to_string()
}

/// Decode a JSON text envelope.
///
/// The discriminator is read from `type`, falling back to `event`. A missing
/// `data` member decodes as an empty object. Numeric ids are stringified.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for invalid JSON, [`CodecError::NotAnObject`]
/// for non-object envelopes, and [`CodecError::MissingKind`] when no
/// discriminator is present.
pub fn decode_text(text: &str) -> Result<PushFrame, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut envelope) = value else {
        return Err(CodecError::NotAnObject);
    };

    let kind = ["type", "event"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_str))
        .ok_or(CodecError::MissingKind)?
        .to_owned();
    let id = envelope.get("id").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let ts = ["ts", "timestamp"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(number_as_i64))
        .unwrap_or(0);
    let scope_id = ["scope_id", "scopeId"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_str))
        .map(str::to_owned);
    let data = envelope
        .remove("data")
        .unwrap_or_else(|| Value::Object(Map::new()));

    Ok(PushFrame { id, ts, scope_id, kind, data })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .filter(|v| (i64::MIN as f64..=i64::MAX as f64).contains(v))
            .map(|v| v as i64)
    })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
