//! Message codec
//!
//! Turns the payload of a `message` wire frame into a [`CanonicalEvent`] and
//! canonical outbound events into emit frames. Keys of the event data are
//! normalized to camelCase so consumers never see the gateway's casing.

use crate::error::{PresenceError, Result};
use crate::event::{CanonicalEvent, EmitFrame};
use serde_json::{Map, Value};

/// Decode a `message` payload.
///
/// Accepts either a JSON string `{"type": T, "data": D}` or the same object
/// already structured. `data` is optional and defaults to `null`.
pub fn decode(payload: &Value) -> Result<CanonicalEvent> {
    let parsed;
    let object = match payload {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw)
                .map_err(|e| PresenceError::MalformedMessage(e.to_string()))?;
            &parsed
        }
        other => other,
    };

    let Value::Object(map) = object else {
        return Err(PresenceError::MalformedMessage(
            "payload is not an object".into(),
        ));
    };

    let kind = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| PresenceError::MalformedMessage("missing `type`".into()))?;
    let data = map.get("data").cloned().unwrap_or(Value::Null);

    Ok(CanonicalEvent::new(kind, camelcase_keys(data)))
}

/// Encode an outbound event as the body of an `emit`.
pub fn encode(event: CanonicalEvent) -> EmitFrame {
    EmitFrame {
        kind: event.kind,
        payload: event.payload,
    }
}

/// Recursively rewrite object keys to camelCase.
pub fn camelcase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (to_camel_case(&k), camelcase_keys(v)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camelcase_keys).collect()),
        scalar => scalar,
    }
}

/// `room_name`, `RoomName`, `room-name` → `roomName`.
///
/// Leading underscores survive (`_id` stays `_id`).
pub fn to_camel_case(key: &str) -> String {
    let body = key.trim_start_matches('_');
    let prefix = &key[..key.len() - body.len()];

    let mut out = String::with_capacity(key.len());
    out.push_str(prefix);

    let mut first = true;
    for segment in body.split(['_', '-']).filter(|s| !s.is_empty()) {
        let mut chars = segment.chars();
        let Some(head) = chars.next() else {
            continue;
        };
        if first {
            out.extend(head.to_lowercase());
            first = false;
        } else {
            out.extend(head.to_uppercase());
        }
        out.push_str(chars.as_str());
    }
    out
}
