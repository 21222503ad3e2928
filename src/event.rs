//! Message shapes exchanged between the gateway link, the shared connection
//! and the per-tab proxies
//!
//! - `WireMessage`: shared connection → proxy (and gateway → shared connection)
//! - `ControlMessage`: proxy → shared connection
//! - `CanonicalEvent`: decoded unit handed to the event bus

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raised on every `connect` from the shared connection
pub const SOCKET_CONNECTED: &str = "SOCKET_CONNECTED";
/// Raised on every `disconnect` from the shared connection
pub const SOCKET_DISCONNECTED: &str = "SOCKET_DISCONNECTED";
/// Presence delta pushed by the gateway
pub const ACTIVITY_UPDATE_PRESENCE: &str = "ACTIVITY_UPDATE_PRESENCE";
/// A session left a room
pub const ACTIVITY_LEAVE_PRESENCE: &str = "ACTIVITY_LEAVE_PRESENCE";
/// Reply to a `presence_snapshot` emit
pub const PRESENCE_SNAPSHOT: &str = "PRESENCE_SNAPSHOT";

/// Emit type for pushing the local position
pub const EMIT_UPDATE_PRESENCE: &str = "update_presence";
/// Emit type for requesting a room snapshot
pub const EMIT_PRESENCE_SNAPSHOT: &str = "presence_snapshot";

/// Decoded application event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl CanonicalEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Inbound message delivered to a consumer port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMessage {
    /// Liveness check; the port must answer with `ControlMessage::Pong`
    Ping,
    /// Link established, carries the session id
    Connect(String),
    /// Link lost
    Disconnect,
    /// Session id announced without a state change
    Sid(String),
    /// Application message: JSON string or structured `{type, data}`
    Message(Value),
}

/// Outbound `emit` body, written to the link as one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Message from a consumer port to the shared connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    Config { url: String },
    Init,
    Reconnect,
    Emit(EmitFrame),
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_message_shapes() {
        let msg: WireMessage = serde_json::from_str(r#"{"type":"connect","payload":"abc"}"#).unwrap();
        assert_eq!(msg, WireMessage::Connect("abc".into()));

        let msg: WireMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, WireMessage::Ping);

        let msg: WireMessage = serde_json::from_str(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(msg, WireMessage::Disconnect);

        let msg: WireMessage =
            serde_json::from_str(r#"{"type":"message","payload":"{\"type\":\"X\"}"}"#).unwrap();
        assert_eq!(msg, WireMessage::Message(json!("{\"type\":\"X\"}")));
    }

    #[test]
    fn unknown_wire_type_rejected() {
        assert!(serde_json::from_str::<WireMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn control_message_shapes() {
        let json = serde_json::to_value(ControlMessage::Config {
            url: "tcp://127.0.0.1:2333".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            json!({"type": "config", "payload": {"url": "tcp://127.0.0.1:2333"}})
        );

        let json = serde_json::to_value(ControlMessage::Init).unwrap();
        assert_eq!(json, json!({"type": "init"}));

        let json = serde_json::to_value(ControlMessage::Emit(EmitFrame {
            kind: "update_presence".into(),
            payload: json!({"position": 3}),
        }))
        .unwrap();
        assert_eq!(
            json,
            json!({"type": "emit", "payload": {"type": "update_presence", "payload": {"position": 3}}})
        );
    }

    #[test]
    fn canonical_event_kind() {
        let event = CanonicalEvent::new(SOCKET_CONNECTED, Value::Null);
        assert!(event.is(SOCKET_CONNECTED));
        assert!(!event.is(SOCKET_DISCONNECTED));
    }
}
