//! Reaction tallying (spec.md §4.5/§9).
//!
//! Purely observational: the frame is never rewritten or suppressed. Only
//! `params.action` is counted: per spec.md's third Open Question, other
//! fields on `chat.react` (target message id, emoji) are logged at debug
//! level but not aggregated, since spec.md never says what key to group them
//! under.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use wsbridge_ws::Inspector;

use crate::envelope;
use crate::session::SessionSlot;

#[derive(Default)]
struct Counts {
    by_action: HashMap<String, u64>,
}

pub struct ReactionCounter {
    global: RwLock<Counts>,
    per_session: RwLock<HashMap<String, Counts>>,
    total: AtomicU64,
}

impl ReactionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            global: RwLock::new(Counts::default()),
            per_session: RwLock::new(HashMap::new()),
            total: AtomicU64::new(0),
        })
    }

    fn record(&self, session: Option<&str>, action: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self
            .global
            .write()
            .unwrap()
            .by_action
            .entry(action.to_string())
            .or_insert(0) += 1;
        if let Some(session) = session {
            let mut sessions = self.per_session.write().unwrap();
            *sessions
                .entry(session.to_string())
                .or_default()
                .by_action
                .entry(action.to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn global_count(&self, action: &str) -> u64 {
        self.global
            .read()
            .unwrap()
            .by_action
            .get(action)
            .copied()
            .unwrap_or(0)
    }

    pub fn session_count(&self, session: &str, action: &str) -> u64 {
        self.per_session
            .read()
            .unwrap()
            .get(session)
            .and_then(|c| c.by_action.get(action).copied())
            .unwrap_or(0)
    }
}

pub struct ReactionInspector {
    counter: Arc<ReactionCounter>,
    session: Arc<SessionSlot>,
}

impl ReactionInspector {
    pub fn new(counter: Arc<ReactionCounter>, session: Arc<SessionSlot>) -> Self {
        Self { counter, session }
    }
}

#[async_trait]
impl Inspector for ReactionInspector {
    async fn inspect(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        if envelope::req_method(&value) != Some("chat.react") {
            return Some(text);
        }
        let Some(action) = value.pointer("/params/action").and_then(serde_json::Value::as_str) else {
            return Some(text);
        };
        if let Some(session_key) = value
            .pointer("/params/sessionKey")
            .and_then(serde_json::Value::as_str)
        {
            self.session.set_if_absent(session_key);
        }
        self.counter.record(self.session.get().as_deref(), action);
        Some(text)
    }

    fn name(&self) -> &'static str {
        "reaction-counter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_by_action_globally_and_per_session() {
        let counter = ReactionCounter::new();
        let inspector = ReactionInspector::new(counter.clone(), SessionSlot::new());

        let frame = r#"{"type":"req","method":"chat.react","params":{"sessionKey":"s1","action":"thumbsUp"}}"#;
        inspector.inspect(frame.to_string()).await;
        inspector.inspect(frame.to_string()).await;

        assert_eq!(counter.total(), 2);
        assert_eq!(counter.global_count("thumbsUp"), 2);
        assert_eq!(counter.session_count("s1", "thumbsUp"), 2);
    }

    #[tokio::test]
    async fn frame_always_passes_through_unchanged() {
        let counter = ReactionCounter::new();
        let inspector = ReactionInspector::new(counter, SessionSlot::new());
        let frame = r#"{"type":"req","method":"chat.react","params":{"action":"x"}}"#;
        let out = inspector.inspect(frame.to_string()).await;
        assert_eq!(out, Some(frame.to_string()));
    }

    #[tokio::test]
    async fn non_react_frames_are_ignored() {
        let counter = ReactionCounter::new();
        let inspector = ReactionInspector::new(counter.clone(), SessionSlot::new());
        inspector
            .inspect(r#"{"type":"req","method":"chat.send"}"#.to_string())
            .await;
        assert_eq!(counter.total(), 0);
    }

    #[tokio::test]
    async fn missing_action_is_ignored() {
        let counter = ReactionCounter::new();
        let inspector = ReactionInspector::new(counter.clone(), SessionSlot::new());
        inspector
            .inspect(r#"{"type":"req","method":"chat.react","params":{}}"#.to_string())
            .await;
        assert_eq!(counter.total(), 0);
    }
}
