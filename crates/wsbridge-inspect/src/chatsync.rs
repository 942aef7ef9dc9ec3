//! Chat-session cross-device broadcast and history (spec.md §4.7).

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use wsbridge_ws::{DirectWriter, Inspector};

use crate::envelope;
use crate::session::SessionSlot;
use crate::store::{ClientRegistry, ContentItem, MessageStore, StoredMessage};

const DEFAULT_HISTORY_LIMIT: usize = 50;

fn random_id() -> String {
    let mut rng = rand::rng();
    (0..16)
        .map(|_| {
            let idx = rng.random_range(0..16u8);
            std::char::from_digit(idx as u32, 16).unwrap()
        })
        .collect()
}

fn message_text(params: &Value) -> String {
    params
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Client→upstream chat-sync state, constructed fresh per connection.
pub struct ChatSyncUpstream {
    session: Arc<SessionSlot>,
    client_id: String,
    store: Arc<MessageStore>,
    registry: Arc<ClientRegistry>,
    client_writer: Arc<dyn DirectWriter>,
}

impl ChatSyncUpstream {
    pub fn new(
        session: Arc<SessionSlot>,
        store: Arc<MessageStore>,
        registry: Arc<ClientRegistry>,
        client_writer: Arc<dyn DirectWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            client_id: random_id(),
            store,
            registry,
            client_writer,
        })
    }

    fn discover_session(&self, params: &Value) {
        if let Some(key) = params
            .get("sessionKey")
            .or_else(|| params.get("session"))
            .and_then(Value::as_str)
        {
            self.session.set_if_absent(key);
        }
    }

    async fn handle_chat_send(&self, value: &Value) -> String {
        let original = serde_json::to_string(value).unwrap_or_default();
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        self.discover_session(&params);
        let Some(session_key) = self.session.get() else {
            // No session could be discovered at all — nothing to sync
            // against, pass the frame through untouched.
            return original;
        };

        self.registry.register(
            &session_key,
            &self.client_id,
            self.client_writer.clone(),
        );

        let idempotency_key = params
            .get("idempotencyKey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| envelope::req_id(value))
            .unwrap_or_else(random_id);

        let text = message_text(&params);
        let run_id = format!("user-{idempotency_key}");

        self.store.append(
            &session_key,
            StoredMessage {
                id: run_id.clone(),
                role: "user".to_string(),
                content: vec![ContentItem::Text { text: text.clone() }],
            },
        );

        let echo = serde_json::json!({
            "type": "event",
            "event": "chat",
            "payload": {
                "runId": run_id,
                "sessionKey": session_key,
                "state": "final",
                "message": { "role": "user", "content": [{ "type": "text", "text": text }] },
            },
        });
        let registry = self.registry.clone();
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            let Ok(echo_text) = serde_json::to_string(&echo) else {
                return;
            };
            registry
                .broadcast_except(&session_key, &client_id, echo_text)
                .await;
        });

        original
    }

    async fn handle_sessions_history(&self, value: &Value) -> Option<String> {
        let original = serde_json::to_string(value).ok();
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_HISTORY_LIMIT);
        let session_key = self.session.get().unwrap_or_default();
        let messages = self.store.get_history(&session_key, limit);
        let Ok(messages_json) = serde_json::to_value(&messages) else {
            return original;
        };
        let req_id = envelope::req_id(value);
        let response = envelope::history_response(req_id.as_deref(), messages_json);
        let Ok(response_text) = serde_json::to_string(&response) else {
            return original;
        };
        match self.client_writer.send_text(response_text).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to write synthesized history response");
                original
            }
        }
    }

    async fn inspect_impl(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        match envelope::req_method(&value) {
            Some("chat.send") => Some(self.handle_chat_send(&value).await),
            Some("sessions.history") => self.handle_sessions_history(&value).await,
            _ => Some(text),
        }
    }

    /// Called by the engine on connection teardown.
    pub fn unregister(&self) {
        if let Some(session_key) = self.session.get() {
            self.registry.unregister(&session_key, &self.client_id);
        }
    }
}

pub struct ChatSyncUpstreamHandle(pub Arc<ChatSyncUpstream>);

#[async_trait]
impl Inspector for ChatSyncUpstreamHandle {
    async fn inspect(&self, text: String) -> Option<String> {
        self.0.inspect_impl(text).await
    }

    fn name(&self) -> &'static str {
        "chat-sync-upstream"
    }
}

/// Upstream→client chat-sync state: stores assistant finals verbatim.
pub struct ChatSyncDownstream {
    session: Arc<SessionSlot>,
    store: Arc<MessageStore>,
}

impl ChatSyncDownstream {
    pub fn new(session: Arc<SessionSlot>, store: Arc<MessageStore>) -> Self {
        Self { session, store }
    }
}

#[async_trait]
impl Inspector for ChatSyncDownstream {
    async fn inspect(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        if !envelope::is_chat_event(&value) {
            return Some(text);
        }
        if envelope::chat_state(&value) != Some("final") || envelope::chat_role(&value) != Some("assistant") {
            return Some(text);
        }

        if let Some(key) = envelope::chat_session_key(&value) {
            self.session.set_if_absent(key);
        }
        let session_key = self.session.get().unwrap_or_default();
        let run_id = envelope::chat_run_id(&value)
            .map(str::to_string)
            .unwrap_or_else(random_id);

        let content_value = value
            .pointer("/payload/message/content")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let content: Vec<ContentItem> = match serde_json::from_value(content_value) {
            Ok(items) => items,
            Err(_) => return Some(text),
        };
        let text_only: Vec<ContentItem> = content
            .into_iter()
            .filter(|item| matches!(item, ContentItem::Text { .. }))
            .collect();

        self.store.append(
            &session_key,
            StoredMessage {
                id: run_id,
                role: "assistant".to_string(),
                content: text_only,
            },
        );

        Some(text)
    }

    fn name(&self) -> &'static str {
        "chat-sync-downstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CollectingWriter(Mutex<Vec<String>>);
    #[async_trait]
    impl DirectWriter for CollectingWriter {
        async fn send_text(&self, text: String) -> std::io::Result<()> {
            self.0.lock().unwrap().push(text);
            Ok(())
        }
    }

    #[tokio::test]
    async fn chat_send_stores_and_passes_through() {
        let store = MessageStore::new(10);
        let registry = ClientRegistry::new();
        let writer: Arc<dyn DirectWriter> = Arc::new(CollectingWriter(Mutex::new(Vec::new())));
        let upstream = ChatSyncUpstream::new(
            SessionSlot::new(),
            store.clone(),
            registry.clone(),
            writer,
        );

        let out = upstream
            .inspect_impl(
                r#"{"type":"req","method":"chat.send","id":"r1","params":{"sessionKey":"s1","message":"hello","idempotencyKey":"abc"}}"#
                    .to_string(),
            )
            .await;
        assert!(out.is_some());

        let history = store.get_history("s1", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "user-abc");
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn sessions_history_writes_direct_and_suppresses_forward() {
        let store = MessageStore::new(10);
        store.append(
            "s1",
            StoredMessage {
                id: "m1".to_string(),
                role: "user".to_string(),
                content: vec![ContentItem::Text {
                    text: "hi".to_string(),
                }],
            },
        );
        let registry = ClientRegistry::new();
        let writer: Arc<dyn DirectWriter> =
            Arc::new(CollectingWriter(Mutex::new(Vec::new())));
        let session = SessionSlot::new();
        session.set_if_absent("s1");
        let upstream = ChatSyncUpstream::new(session, store, registry, writer.clone());

        let out = upstream
            .inspect_impl(r#"{"type":"req","method":"sessions.history","id":"q1","params":{}}"#.to_string())
            .await;
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn downstream_stores_final_assistant_text_only() {
        let store = MessageStore::new(10);
        let downstream = ChatSyncDownstream::new(SessionSlot::new(), store.clone());
        let frame = r#"{"type":"event","event":"chat","payload":{"runId":"r1","sessionKey":"s1","state":"final","message":{"role":"assistant","content":[{"type":"text","text":"hi there"}]}}}"#;
        let out = downstream.inspect(frame.to_string()).await;
        assert_eq!(out, Some(frame.to_string()));
        let history = store.get_history("s1", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "assistant");
    }

    #[tokio::test]
    async fn downstream_ignores_deltas() {
        let store = MessageStore::new(10);
        let downstream = ChatSyncDownstream::new(SessionSlot::new(), store.clone());
        let frame = r#"{"type":"event","event":"chat","payload":{"runId":"r1","sessionKey":"s1","state":"delta","message":{"role":"assistant","content":[{"type":"text","text":"partial"}]}}}"#;
        downstream.inspect(frame.to_string()).await;
        assert!(store.get_history("s1", 10).is_empty());
    }

    #[tokio::test]
    async fn malformed_json_passes_through() {
        let store = MessageStore::new(10);
        let downstream = ChatSyncDownstream::new(SessionSlot::new(), store);
        let out = downstream.inspect("{not json".to_string()).await;
        assert_eq!(out, Some("{not json".to_string()));
    }
}
