//! Request/response correlation and message-type dispatch over a [`Channel`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Map;
use tokio::sync::Mutex;
use tracing::warn;

use crate::channel::Channel;
use crate::message::{AgentMessage, MessageType};

/// Errors raised by the protocol layer. None of these are fatal to the
/// broker: a malformed or duplicate frame is dropped and noted.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying channel could not deliver the message.
    #[error(transparent)]
    Channel(#[from] crate::channel::ChannelError),
    /// A sender reused a `message_id` that was already seen from them.
    #[error("duplicate message_id {message_id} from sender {sender_id}")]
    DuplicateMessageId {
        /// The sender that violated the protocol.
        sender_id: String,
        /// The reused message id.
        message_id: String,
    },
}

/// A one-shot callback invoked when the correlated response arrives.
pub type ResponseCallback = Box<dyn FnOnce(AgentMessage) + Send>;

/// A registered handler for a given [`MessageType`]. Async so it can call
/// into agent execution; handlers are expected to spawn their own
/// background work rather than block the dispatch loop for long operations.
pub type MessageHandler = Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Request/response correlation and handler registry layered over a
/// [`Channel`].
pub struct Protocol {
    channel: Arc<Channel>,
    self_id: String,
    handlers: Mutex<HashMap<MessageType, MessageHandler>>,
    pending: Mutex<HashMap<String, ResponseCallback>>,
    seen: Mutex<HashSet<(String, String)>>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("self_id", &self.self_id).finish_non_exhaustive()
    }
}

impl Protocol {
    /// Wrap `channel`, identifying outgoing messages with `self_id`.
    pub fn new(channel: Arc<Channel>, self_id: impl Into<String>) -> Self {
        Self {
            channel,
            self_id: self_id.into(),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Register a handler for `message_type`. A later call for the same
    /// type replaces the earlier one.
    pub async fn register_handler(&self, message_type: MessageType, handler: MessageHandler) {
        self.handlers.lock().await.insert(message_type, handler);
    }

    /// Send a `task_request` to `receiver`, optionally registering a
    /// callback invoked once the correlated `task_response` arrives.
    /// Returns the minted `message_id`.
    pub async fn send_request(
        &self,
        receiver: impl Into<String>,
        payload: Map<String, serde_json::Value>,
        callback: Option<ResponseCallback>,
    ) -> Result<String, ProtocolError> {
        let message = AgentMessage::new(self.self_id.clone(), receiver, MessageType::TaskRequest, payload);
        let message_id = message.message_id.clone();
        if let Some(cb) = callback {
            self.pending.lock().await.insert(message_id.clone(), cb);
        }
        self.channel.send(&message).await?;
        Ok(message_id)
    }

    /// Send a `task_response` to `original`'s sender, correlated by its
    /// `message_id`.
    pub async fn send_response(
        &self,
        original: &AgentMessage,
        payload: Map<String, serde_json::Value>,
    ) -> Result<(), ProtocolError> {
        let response = AgentMessage::respond_to(original, self.self_id.clone(), payload);
        self.channel.send(&response).await?;
        Ok(())
    }

    /// Drain every message currently queued on the channel: correlated
    /// responses invoke and remove their callback; otherwise the message
    /// is dispatched to its type handler, or dropped with a warning if
    /// none is registered. Returns the number of messages processed.
    pub async fn process_messages(&self) -> Result<usize, ProtocolError> {
        let mut processed = 0;
        loop {
            let message = match self.channel.receive(std::time::Duration::from_millis(0)).await {
                Some(m) => m,
                None => break,
            };
            self.dispatch_one(message).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn dispatch_one(&self, message: AgentMessage) -> Result<(), ProtocolError> {
        {
            let mut seen = self.seen.lock().await;
            let key = (message.sender_id.clone(), message.message_id.clone());
            if !seen.insert(key) {
                warn!(sender = %message.sender_id, message_id = %message.message_id, "protocol: duplicate message_id, dropping");
                return Err(ProtocolError::DuplicateMessageId {
                    sender_id: message.sender_id,
                    message_id: message.message_id,
                });
            }
        }

        if message.message_type == MessageType::TaskResponse {
            if let Some(correlation_id) = message.correlation_id.clone() {
                let callback = self.pending.lock().await.remove(&correlation_id);
                if let Some(callback) = callback {
                    callback(message);
                    return Ok(());
                }
            }
        }

        let handler = self.handlers.lock().await.get(&message.message_type).cloned();
        match handler {
            Some(handler) => handler(message).await,
            None => warn!(message_type = %message.message_type, "protocol: no handler registered, dropping message"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn response_callback_fires_exactly_once() {
        let path = std::env::temp_dir().join(format!("claude_orch_proto_{}.sock", std::process::id()));
        let server_channel = Arc::new(Channel::open_server(&path).await.unwrap());
        let server = Protocol::new(server_channel.clone(), "coordinator");

        let fire_count = Arc::new(AtomicUsize::new(0));
        let fire_count_cb = fire_count.clone();
        let message_id = server
            .send_request(
                "agent_001",
                Map::new(),
                Some(Box::new(move |_resp| {
                    fire_count_cb.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await;
        // send_request fails to deliver (no connected peer "agent_001"), but the
        // pending callback registration itself is what we're testing here.
        let _ = message_id;

        // Inject a synthetic correlated response directly into the inbound queue.
        let request_id = {
            let pending = server.pending.lock().await;
            pending.keys().next().cloned()
        };
        if let Some(request_id) = request_id {
            let response = AgentMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                sender_id: "agent_001".into(),
                receiver_id: "coordinator".into(),
                message_type: MessageType::TaskResponse,
                payload: Map::new(),
                timestamp: chrono::Utc::now(),
                correlation_id: Some(request_id),
            };
            server_channel.inbound_sender().send(response).unwrap();
            server.process_messages().await.unwrap();
        }

        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_message_id_from_same_sender_is_a_protocol_error() {
        let path = std::env::temp_dir().join(format!("claude_orch_proto_dup_{}.sock", std::process::id()));
        let channel = Arc::new(Channel::open_server(&path).await.unwrap());
        let protocol = Protocol::new(channel.clone(), "coordinator");
        protocol
            .register_handler(
                MessageType::Heartbeat,
                Arc::new(|_msg| Box::pin(async {})),
            )
            .await;

        let msg = AgentMessage::new("agent_001", "coordinator", MessageType::Heartbeat, Map::new());
        channel.inbound_sender().send(msg.clone()).unwrap();
        channel.inbound_sender().send(msg).unwrap();

        let result = protocol.process_messages().await;
        assert!(matches!(result, Err(ProtocolError::DuplicateMessageId { .. })));
    }

    #[tokio::test]
    async fn unknown_handler_drops_message_without_error() {
        let path = std::env::temp_dir().join(format!("claude_orch_proto_unk_{}.sock", std::process::id()));
        let channel = Arc::new(Channel::open_server(&path).await.unwrap());
        let protocol = Protocol::new(channel.clone(), "coordinator");
        let msg = AgentMessage::new("agent_001", "coordinator", MessageType::Coordination, Map::new());
        channel.inbound_sender().send(msg).unwrap();
        let processed = protocol.process_messages().await.unwrap();
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn process_messages_drains_the_whole_queue() {
        let path = std::env::temp_dir().join(format!("claude_orch_proto_drain_{}.sock", std::process::id()));
        let channel = Arc::new(Channel::open_server(&path).await.unwrap());
        let protocol = Protocol::new(channel.clone(), "coordinator");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        protocol
            .register_handler(
                MessageType::Heartbeat,
                Arc::new(move |_msg| {
                    let seen = seen_cb.clone();
                    Box::pin(async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;
        for _ in 0..5 {
            let msg = AgentMessage::new("agent_001", "coordinator", MessageType::Heartbeat, Map::new());
            channel.inbound_sender().send(msg).unwrap();
        }
        let processed = protocol.process_messages().await.unwrap();
        assert_eq!(processed, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
