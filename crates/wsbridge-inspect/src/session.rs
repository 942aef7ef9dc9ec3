//! Per-connection lazily-discovered session key, shared between whichever
//! inspectors need to key shared state (message store, client registry,
//! canvas tracker) by session.
//!
//! spec.md §4.7 states chat-sync discovers its session key lazily from the
//! first `chat.send`/`sessions.history` request. The canvas tracker needs
//! the same key to scope replay to the right session, and canvas frames are
//! expected to carry `params.sessionKey` symmetrically with the chat event
//! envelope's `payload.sessionKey` (see DESIGN.md's resolution of spec.md's
//! first Open Question). `SessionSlot` is the shared, set-once handle both
//! inspector families read and write.

use std::sync::Mutex;

use tokio::sync::Notify;

pub struct SessionSlot {
    key: Mutex<Option<String>>,
    notify: Notify,
}

impl SessionSlot {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            key: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    pub fn get(&self) -> Option<String> {
        self.key.lock().unwrap().clone()
    }

    /// Sets the session key the first time it's discovered; later calls with
    /// a different value are ignored (a connection belongs to one session).
    pub fn set_if_absent(&self, key: &str) {
        let mut slot = self.key.lock().unwrap();
        if slot.is_none() {
            *slot = Some(key.to_string());
            drop(slot);
            self.notify.notify_waiters();
        }
    }

    /// Resolves with the session key as soon as one is discovered (by
    /// whichever inspector sees it first), or immediately if already known.
    /// Used by the engine to fire canvas replay once a reconnecting client's
    /// session becomes known, without blocking connection setup on it.
    pub async fn wait_for_key(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(key) = self.get() {
                return key;
            }
            notified.await;
        }
    }
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            key: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}
