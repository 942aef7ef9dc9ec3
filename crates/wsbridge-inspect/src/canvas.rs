//! Canvas state shadowing and replay (spec.md §4.5).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use wsbridge_ws::{DirectWriter, Inspector};

use crate::envelope;
use crate::session::SessionSlot;

struct CanvasState {
    visible: bool,
    present_message: Option<String>,
    append_ring: VecDeque<String>,
    updated_at: Instant,
}

impl CanvasState {
    fn new() -> Self {
        Self {
            visible: false,
            present_message: None,
            append_ring: VecDeque::new(),
            updated_at: Instant::now(),
        }
    }
}

pub struct CanvasTracker {
    sessions: RwLock<HashMap<String, CanvasState>>,
    ring_capacity: usize,
    staleness_horizon: Duration,
    replay_frame_count: AtomicU64,
}

impl CanvasTracker {
    pub fn new(ring_capacity: usize, staleness_horizon: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            ring_capacity,
            staleness_horizon,
            replay_frame_count: AtomicU64::new(0),
        })
    }

    fn observe(&self, session: &str, method: &str, raw_text: &str) {
        let mut sessions = self.sessions.write().unwrap();
        let state = sessions
            .entry(session.to_string())
            .or_insert_with(CanvasState::new);
        match method {
            "canvas.present" => {
                state.present_message = Some(raw_text.to_string());
                state.append_ring.clear();
                state.visible = true;
            }
            "canvas.hide" => {
                state.visible = false;
            }
            "canvas.a2ui.pushJSONL" => {
                if state.append_ring.len() >= self.ring_capacity {
                    state.append_ring.pop_front();
                }
                state.append_ring.push_back(raw_text.to_string());
            }
            _ => return,
        }
        state.updated_at = Instant::now();
    }

    /// Replays buffered present+appends to `writer` for `session`. Writes
    /// zero frames if hidden, stale, or empty — snapshot taken under the
    /// read lock and released before any I/O (spec.md §5 invariant iv).
    pub async fn replay(&self, session: &str, writer: &dyn DirectWriter) -> usize {
        let snapshot = {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(session) {
                None => return 0,
                Some(state) => {
                    if !state.visible || state.present_message.is_none() {
                        return 0;
                    }
                    if state.updated_at.elapsed() > self.staleness_horizon {
                        return 0;
                    }
                    (
                        state.present_message.clone().unwrap(),
                        state.append_ring.iter().cloned().collect::<Vec<_>>(),
                    )
                }
            }
        };
        let (present, appends) = snapshot;
        let mut written = 0;
        if writer.send_text(present).await.is_ok() {
            written += 1;
        }
        for append in appends {
            if writer.send_text(append).await.is_ok() {
                written += 1;
            }
        }
        self.replay_frame_count
            .fetch_add(written as u64, Ordering::Relaxed);
        written
    }

    pub fn replay_frame_total(&self) -> u64 {
        self.replay_frame_count.load(Ordering::Relaxed)
    }
}

/// Upstream→client inspector: observes `canvas.*` methods, updates the
/// tracker, and optionally injects a configured URL into `canvas.present`
/// params before the frame continues downstream.
pub struct CanvasInspector {
    tracker: Arc<CanvasTracker>,
    session: Arc<SessionSlot>,
    inject_url: Option<String>,
}

impl CanvasInspector {
    pub fn new(
        tracker: Arc<CanvasTracker>,
        session: Arc<SessionSlot>,
        inject_url: Option<String>,
    ) -> Self {
        Self {
            tracker,
            session,
            inject_url,
        }
    }
}

const CANVAS_METHODS: &[&str] = &["canvas.present", "canvas.hide", "canvas.a2ui.pushJSONL"];

#[async_trait]
impl Inspector for CanvasInspector {
    async fn inspect(&self, text: String) -> Option<String> {
        let Some(value) = envelope::parse(&text) else {
            return Some(text);
        };
        let Some(method) = envelope::req_method(&value) else {
            return Some(text);
        };
        if !CANVAS_METHODS.contains(&method) {
            return Some(text);
        }

        if let Some(session_key) = value
            .pointer("/params/sessionKey")
            .and_then(serde_json::Value::as_str)
        {
            self.session.set_if_absent(session_key);
        }
        let session_key = self.session.get().unwrap_or_else(|| "default".to_string());

        if method == "canvas.present" {
            if let Some(url) = &self.inject_url {
                let mut rewritten = value.clone();
                if let Some(params) = rewritten.get_mut("params") {
                    if let Some(obj) = params.as_object_mut() {
                        obj.insert("url".to_string(), serde_json::Value::String(url.clone()));
                    }
                }
                let rewritten_text = match serde_json::to_string(&rewritten) {
                    Ok(s) => s,
                    Err(_) => return Some(text),
                };
                self.tracker.observe(&session_key, method, &rewritten_text);
                return Some(rewritten_text);
            }
        }

        self.tracker.observe(&session_key, method, &text);
        Some(text)
    }

    fn name(&self) -> &'static str {
        "canvas"
    }
}
