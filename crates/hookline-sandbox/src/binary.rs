//! Serialized byte-buffer shape shared by the host and the sandbox.
//!
//! Binary values cross the boundary as `{"type":"Buffer","data":[u8, ...]}`.
//! The sandbox bootstrap turns that shape back into a native `Buffer` wherever
//! it appears in a bridge result (recursively); on the host side the helpers
//! below convert between the shape and `Vec<u8>`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Tag value marking a serialized byte buffer.
pub const BUFFER_TAG: &str = "Buffer";

/// Encode bytes into the serialized buffer shape.
pub fn encode_bytes(bytes: &[u8]) -> Value {
    let mut obj = Map::with_capacity(2);
    obj.insert("type".into(), Value::String(BUFFER_TAG.into()));
    obj.insert(
        "data".into(),
        Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    );
    Value::Object(obj)
}

/// Returns true if `value` has the serialized buffer shape.
pub fn is_buffer_shape(value: &Value) -> bool {
    match value {
        Value::Object(obj) => {
            obj.get("type").and_then(Value::as_str) == Some(BUFFER_TAG)
                && obj.get("data").is_some_and(Value::is_array)
        }
        _ => false,
    }
}

/// Decode a value into bytes.
///
/// Accepts the buffer shape, a bare array of octets, or a string (taken as
/// UTF-8). `null` decodes to an empty buffer. Anything else is `None`.
pub fn decode_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => Some(Vec::new()),
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Array(items) => octets(items),
        Value::Object(obj) if is_buffer_shape(value) => {
            obj.get("data").and_then(Value::as_array).and_then(|a| octets(a))
        }
        _ => None,
    }
}

fn octets(items: &[Value]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

/// Serde adapter for `Vec<u8>` fields carried in the buffer shape.
///
/// Use with `#[serde(with = "crate::binary::bytes")]`.
pub mod bytes {
    use super::*;

    /// Serialize bytes as the buffer shape.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        encode_bytes(bytes).serialize(serializer)
    }

    /// Deserialize bytes from the buffer shape, an octet array, or a string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        decode_bytes(&value).ok_or_else(|| {
            serde::de::Error::custom("expected a byte buffer, octet array, or string")
        })
    }
}
