//! The `AgentMessage` wire type exchanged between the broker and agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identity meaning "every connected peer other than the sender."
pub const BROADCAST: &str = "broadcast";

/// Tag selecting which schema a message's `payload` follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A request for a peer to perform work.
    TaskRequest,
    /// A reply to a `task_request`, correlated via `correlation_id`.
    TaskResponse,
    /// Unsolicited status notification (e.g. agent state change).
    StatusUpdate,
    /// General coordination payload not tied to a task.
    Coordination,
    /// Liveness probe.
    Heartbeat,
    /// Out-of-band error notification.
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::Coordination => "coordination",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single frame of the peer-to-peer protocol.
///
/// `payload` is an opaque structured map: known message types interpret
/// specific keys, unknown keys are preserved and forwarded untouched so the
/// protocol can be extended without breaking older peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique per-sender identifier for this message.
    pub message_id: String,
    /// Identity of the sender.
    pub sender_id: String,
    /// Identity of the intended recipient, or [`BROADCAST`].
    pub receiver_id: String,
    /// Schema tag for `payload`.
    pub message_type: MessageType,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Wall-clock time the message was constructed.
    pub timestamp: DateTime<Utc>,
    /// For `task_response`, the `message_id` of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AgentMessage {
    /// Build a new message with a freshly minted `message_id` and the
    /// current wall-clock timestamp.
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        message_type: MessageType,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            message_type,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build a `task_response` correlated to `request`, addressed back to
    /// the request's sender.
    pub fn respond_to(
        request: &AgentMessage,
        sender_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            receiver_id: request.sender_id.clone(),
            message_type: MessageType::TaskResponse,
            payload,
            timestamp: Utc::now(),
            correlation_id: Some(request.message_id.clone()),
        }
    }

    /// Whether this message is addressed to every peer but the sender.
    pub fn is_broadcast(&self) -> bool {
        self.receiver_id == BROADCAST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_to_sets_correlation_id_and_swaps_direction() {
        let request = AgentMessage::new("agent_001", "agent_002", MessageType::TaskRequest, Map::new());
        let response = AgentMessage::respond_to(&request, "agent_002", Map::new());
        assert_eq!(response.correlation_id.as_deref(), Some(request.message_id.as_str()));
        assert_eq!(response.sender_id, "agent_002");
        assert_eq!(response.receiver_id, "agent_001");
        assert_eq!(response.message_type, MessageType::TaskResponse);
    }

    #[test]
    fn round_trips_through_json() {
        let mut payload = Map::new();
        payload.insert("foo".into(), Value::from("bar"));
        let msg = AgentMessage::new("a", "b", MessageType::Heartbeat, payload);
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: AgentMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn unknown_payload_keys_survive_round_trip() {
        let raw = serde_json::json!({
            "message_id": "m1",
            "sender_id": "a",
            "receiver_id": "broadcast",
            "message_type": "coordination",
            "payload": {"future_field": 42, "known": "x"},
            "timestamp": "2026-01-01T00:00:00Z",
        });
        let decoded: AgentMessage = serde_json::from_value(raw).unwrap();
        assert!(decoded.is_broadcast());
        assert_eq!(decoded.payload.get("future_field").and_then(Value::as_i64), Some(42));
    }
}
