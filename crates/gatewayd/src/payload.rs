//! Payload trees exchanged with plugins
//!
//! Hook payloads are plain JSON objects on the gateway side and
//! `google.protobuf.Struct` values on the wire. The conversion is lossless
//! for the primitive value set: null, bool, number, string, list, dict.
//! Values outside the set are cast at the edges before a payload is built:
//! durations become fractional seconds, binary buffers become base64
//! strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value as PbValue};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Payload field holding the inbound connection's addresses
pub fn client_value(local: &str, remote: &str) -> Value {
    json!({ "local": local, "remote": remote })
}

/// Encode a binary buffer as a base64 payload field
pub fn encode_bytes(data: &[u8]) -> Value {
    Value::String(BASE64.encode(data))
}

/// Decode a base64 payload field back into bytes
pub fn decode_bytes(value: &Value) -> Option<Vec<u8>> {
    value.as_str().and_then(|s| BASE64.decode(s).ok())
}

/// Cast a duration to a fractional-seconds number field
pub fn duration_secs(duration: Duration) -> Value {
    json!(duration.as_secs_f64())
}

/// Pull a possibly-rewritten binary field out of a hook result.
///
/// Returns the decoded rewrite when the field is present and valid base64;
/// otherwise keeps `original` (a malformed rewrite is logged, not forwarded).
pub fn rewritten_bytes(result: &Value, field: &str, original: Vec<u8>) -> Vec<u8> {
    match result.get(field) {
        Some(value) => match decode_bytes(value) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!(field, "hook result field is not valid base64, keeping original");
                original
            }
        },
        None => original,
    }
}

/// Convert a JSON object into a protobuf Struct
pub fn to_struct(fields: &Map<String, Value>) -> Struct {
    Struct {
        fields: fields
            .iter()
            .map(|(k, v)| (k.clone(), to_pb_value(v)))
            .collect(),
    }
}

/// Convert a protobuf Struct back into a JSON object
pub fn from_struct(value: &Struct) -> Map<String, Value> {
    value
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), from_pb_value(v)))
        .collect()
}

fn to_pb_value(value: &Value) -> PbValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(to_pb_value).collect(),
        }),
        Value::Object(fields) => Kind::StructValue(to_struct(fields)),
    };
    PbValue { kind: Some(kind) }
}

fn from_pb_value(value: &PbValue) -> Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => {
            // Struct numbers are all f64; restore integer form where exact so
            // payloads round-trip byte-identically.
            if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                json!(*n as i64)
            } else {
                serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
            }
        }
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ListValue(items)) => Value::Array(items.values.iter().map(from_pb_value).collect()),
        Some(Kind::StructValue(fields)) => Value::Object(from_struct(fields)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) -> Value {
        let fields = value.as_object().cloned().unwrap();
        Value::Object(from_struct(&to_struct(&fields)))
    }

    #[test]
    fn test_round_trip_primitives() {
        let payload = json!({
            "null": null,
            "flag": true,
            "count": 42,
            "ratio": 1.5,
            "name": "gatewayd",
            "list": [1, 2, 3],
            "nested": { "inner": "value", "depth": [true, false] }
        });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_round_trip_negative_and_zero() {
        let payload = json!({ "neg": -7, "zero": 0, "negf": -2.25 });
        assert_eq!(round_trip(payload.clone()), payload);
    }

    #[test]
    fn test_bytes_round_trip() {
        let data = vec![0x01, 0x02, 0x03, 0x04, 0xff];
        let encoded = encode_bytes(&data);
        assert_eq!(decode_bytes(&encoded).unwrap(), data);
    }

    #[test]
    fn test_duration_cast() {
        let value = duration_secs(Duration::from_millis(1500));
        assert_eq!(value.as_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_rewritten_bytes_keeps_original_on_bad_base64() {
        let result = json!({ "request": "not@base64!" });
        let original = vec![1, 2, 3];
        assert_eq!(
            rewritten_bytes(&result, "request", original.clone()),
            original
        );
    }

    #[test]
    fn test_rewritten_bytes_applies_rewrite() {
        let replacement = vec![9, 8, 7];
        let result = json!({ "request": BASE64.encode(&replacement) });
        assert_eq!(rewritten_bytes(&result, "request", vec![1]), replacement);
    }

    #[test]
    fn test_rewritten_bytes_absent_field() {
        let result = json!({ "client": { "local": "a", "remote": "b" } });
        assert_eq!(rewritten_bytes(&result, "request", vec![5, 6]), vec![5, 6]);
    }
}
