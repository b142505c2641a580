//! Decoding of `tools/call` result content into plain strings.
//!
//! Servers are loose about content shapes. Text items pass through, raw
//! byte sequences (JSON arrays of 0-255) are decoded as UTF-8 with invalid
//! sequences replaced, objects with a `text` field have that field decoded
//! the same way, and anything else is stringified. Decoding never fails.

use serde_json::Value;

/// Decode every content item.
pub fn decode_content(items: &[Value]) -> Vec<String> {
    items.iter().map(decode_item).collect()
}

/// Decode a single content item.
pub fn decode_item(item: &Value) -> String {
    match item {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("text") {
            Some(text) => decode_text(text),
            None => item.to_string(),
        },
        Value::Array(_) => as_bytes(item)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| item.to_string()),
        other => other.to_string(),
    }
}

fn decode_text(text: &Value) -> String {
    match text {
        Value::String(s) => s.clone(),
        Value::Array(_) => as_bytes(text)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| text.to_string()),
        other => other.to_string(),
    }
}

fn as_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}
