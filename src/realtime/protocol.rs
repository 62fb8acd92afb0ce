//! Realtime wire protocol
//!
//! JSON frames exchanged with the realtime endpoint, one object per
//! WebSocket text message, discriminated by a `type` field.

use serde::{Deserialize, Serialize};

use crate::state::StateValue;

/// Delivery contract of the realtime channel.
///
/// The server only guarantees eventual delivery of the latest known state of
/// an instance; intermediate transitions may be skipped. Every update must
/// therefore be treated as the authoritative current snapshot, never as a
/// delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    LatestOnly,
}

/// Frames the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "subscribe-to-instance", rename_all = "camelCase")]
    SubscribeToInstance {
        machine_name: String,
        machine_instance_name: String,
        request_id: String,
    },
    #[serde(rename = "unsubscribe-from-instance", rename_all = "camelCase")]
    UnsubscribeFromInstance {
        machine_name: String,
        machine_instance_name: String,
        request_id: String,
    },
    /// Keep-alive, sent on a fixed interval while connected
    #[serde(rename = "ping")]
    Ping,
}

/// A state update for one machine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    pub machine_name: String,
    pub machine_instance_name: String,
    pub state: StateValue,
    #[serde(default)]
    pub public_context: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub done: bool,
}

/// A server-reported error, correlated to the request that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub request_id: String,
    pub status: u16,
    #[serde(default)]
    pub code: String,
}

/// Frames the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "instance-update")]
    InstanceUpdate(InstanceUpdate),
    #[serde(rename = "error")]
    Error(ErrorFrame),
    /// Frame types this client does not understand are ignored, not fatal
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_encoding() {
        let frame = ClientFrame::SubscribeToInstance {
            machine_name: "orders".into(),
            machine_instance_name: "order-17".into(),
            request_id: "req-1".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "subscribe-to-instance",
                "machineName": "orders",
                "machineInstanceName": "order-17",
                "requestId": "req-1",
            })
        );
    }

    #[test]
    fn test_ping_frame_encoding() {
        assert_eq!(
            serde_json::to_string(&ClientFrame::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
    }

    #[test]
    fn test_update_frame_decoding() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{
                "type": "instance-update",
                "machineName": "orders",
                "machineInstanceName": "order-17",
                "state": {"processing": "payment"},
                "publicContext": {"total": 42},
                "tags": ["active"],
                "done": false
            }"#,
        )
        .unwrap();
        let ServerFrame::InstanceUpdate(update) = frame else {
            panic!("expected an instance-update frame");
        };
        assert_eq!(update.machine_name, "orders");
        assert_eq!(update.tags, vec!["active"]);
        assert!(!update.done);
    }

    #[test]
    fn test_update_frame_optional_fields_default() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{
                "type": "instance-update",
                "machineName": "orders",
                "machineInstanceName": "order-17",
                "state": "idle"
            }"#,
        )
        .unwrap();
        let ServerFrame::InstanceUpdate(update) = frame else {
            panic!("expected an instance-update frame");
        };
        assert_eq!(update.public_context, None);
        assert!(update.tags.is_empty());
        assert!(!update.done);
    }

    #[test]
    fn test_error_frame_decoding() {
        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"error","requestId":"req-1","status":403,"code":"rejected-by-machine-authorizer"}"#,
        )
        .unwrap();
        let ServerFrame::Error(error) = frame else {
            panic!("expected an error frame");
        };
        assert_eq!(error.status, 403);
        assert_eq!(error.code, "rejected-by-machine-authorizer");
    }

    #[test]
    fn test_unknown_frame_tolerated() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"something-new","extra":true}"#).unwrap();
        assert_eq!(frame, ServerFrame::Unknown);
    }
}
