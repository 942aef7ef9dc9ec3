//! Per-session message history and the live-client broadcast registry.
//!
//! Grounded on the read-write-lock discipline spec.md §5 prescribes for
//! these two structures: broadcasts/replays snapshot targets under the read
//! lock and perform I/O after releasing it, the same pattern the teacher
//! uses for its `DashMap`-guarded tunnel table in `nomadflow-relay`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use wsbridge_ws::DirectWriter;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        content: String,
    },
    File {
        #[serde(rename = "mimeType")]
        mime_type: String,
        content: String,
        #[serde(rename = "fileName", skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(rename = "fileSize", skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: Vec<ContentItem>,
}

/// Per-session bounded ring of recent chat messages.
pub struct MessageStore {
    sessions: RwLock<HashMap<String, VecDeque<StoredMessage>>>,
    max_size: usize,
}

impl MessageStore {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_size,
        })
    }

    pub fn append(&self, session: &str, message: StoredMessage) {
        let mut sessions = self.sessions.write().unwrap();
        let ring = sessions.entry(session.to_string()).or_default();
        if ring.len() >= self.max_size {
            ring.pop_front();
        }
        ring.push_back(message);
    }

    /// Newest `limit` entries in chronological order; a defensive copy so
    /// the caller mutating the result never touches the store.
    pub fn get_history(&self, session: &str, limit: usize) -> Vec<StoredMessage> {
        let sessions = self.sessions.read().unwrap();
        match sessions.get(session) {
            None => Vec::new(),
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
        }
    }
}

/// Per-session set of live downstream writers, for cross-device broadcast.
pub struct ClientRegistry {
    sessions: RwLock<HashMap<String, HashMap<String, Arc<dyn DirectWriter>>>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, session: &str, client_id: &str, writer: Arc<dyn DirectWriter>) {
        let mut sessions = self.sessions.write().unwrap();
        sessions
            .entry(session.to_string())
            .or_default()
            .insert(client_id.to_string(), writer);
    }

    /// Removes `client_id` from `session`; removes the session entry
    /// entirely once it has no clients left.
    pub fn unregister(&self, session: &str, client_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(clients) = sessions.get_mut(session) {
            clients.remove(client_id);
            if clients.is_empty() {
                sessions.remove(session);
            }
        }
    }

    /// Send `text` to every registered client on `session` except
    /// `exclude_client_id`. Targets are snapshotted under the read lock and
    /// released before any write, so a slow writer never blocks other
    /// sessions' broadcasts.
    pub async fn broadcast_except(&self, session: &str, exclude_client_id: &str, text: String) {
        let targets: Vec<Arc<dyn DirectWriter>> = {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(session) {
                None => return,
                Some(clients) => clients
                    .iter()
                    .filter(|(id, _)| id.as_str() != exclude_client_id)
                    .map(|(_, w)| w.clone())
                    .collect(),
            }
        };
        for writer in targets {
            if let Err(e) = writer.send_text(text.clone()).await {
                tracing::warn!(error = %e, "broadcast write failed");
            }
        }
    }

    pub fn client_count(&self, session: &str) -> usize {
        self.sessions
            .read()
            .unwrap()
            .get(session)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(id: &str) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            role: "user".to_string(),
            content: vec![ContentItem::Text {
                text: id.to_string(),
            }],
        }
    }

    #[test]
    fn unknown_session_returns_empty_history() {
        let store = MessageStore::new(10);
        assert!(store.get_history("nope", 5).is_empty());
    }

    #[test]
    fn history_round_trips_chronologically_and_is_a_copy() {
        let store = MessageStore::new(10);
        for i in 0..5 {
            store.append("s1", msg(&i.to_string()));
        }
        let mut history = store.get_history("s1", 3);
        assert_eq!(
            history.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            vec!["2", "3", "4"]
        );
        history.push(msg("mutated"));
        // mutating the returned Vec must not affect the store
        assert_eq!(store.get_history("s1", 10).len(), 5);
    }

    #[test]
    fn overflow_discards_oldest() {
        let store = MessageStore::new(3);
        for i in 0..5 {
            store.append("s1", msg(&i.to_string()));
        }
        let history = store.get_history("s1", 10);
        assert_eq!(
            history.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            vec!["2", "3", "4"]
        );
    }

    struct CountingWriter(Arc<AtomicUsize>);
    #[async_trait]
    impl DirectWriter for CountingWriter {
        async fn send_text(&self, _text: String) -> std::io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let registry = ClientRegistry::new();
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        registry.register("s1", "a", Arc::new(CountingWriter(a_count.clone())));
        registry.register("s1", "b", Arc::new(CountingWriter(b_count.clone())));

        registry.broadcast_except("s1", "a", "hi".to_string()).await;

        assert_eq!(a_count.load(Ordering::SeqCst), 0);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregister_removes_empty_session() {
        let registry = ClientRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.register("s1", "a", Arc::new(CountingWriter(count)));
        registry.unregister("s1", "a");
        assert_eq!(registry.client_count("s1"), 0);
    }
}
