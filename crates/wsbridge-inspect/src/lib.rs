//! The inspector pipeline: canvas shadowing, chat-sync, media injection,
//! file receipt, and reaction tallying (spec.md §4.5–§4.8).
//!
//! Each feature is built from shared per-process state (`PipelineState`) and
//! per-connection state (`ConnectionInspectors`), mirroring how the teacher's
//! `nomadflow-relay` keeps process-wide tables (`DashMap`s) but hands each
//! tunnel its own lightweight per-connection context.

pub mod canvas;
pub mod chatsync;
pub mod envelope;
pub mod filereceive;
pub mod media;
pub mod reaction;
pub mod session;
pub mod store;

use std::sync::Arc;

use wsbridge_ws::{DirectWriter, Inspector, InspectorChain};

pub use canvas::{CanvasInspector, CanvasTracker};
pub use chatsync::{ChatSyncDownstream, ChatSyncUpstream, ChatSyncUpstreamHandle};
pub use filereceive::{FileReceiveConfig, FileReceiveInspector};
pub use media::{MediaConfig, MediaInjector};
pub use reaction::{ReactionCounter, ReactionInspector};
pub use session::SessionSlot;
pub use store::{ClientRegistry, ContentItem, MessageStore, StoredMessage};

/// Process-wide state shared across every connection, built once at startup
/// from configuration and handed to each new connection's
/// [`ConnectionInspectors::build`].
pub struct PipelineState {
    pub canvas: Arc<CanvasTracker>,
    pub message_store: Arc<MessageStore>,
    pub client_registry: Arc<ClientRegistry>,
    pub media: Arc<MediaInjector>,
    pub reactions: Arc<ReactionCounter>,
    pub file_receive: Arc<FileReceiveConfig>,
    pub canvas_inject_url: Option<String>,
    pub history_limit: usize,
}

impl PipelineState {
    pub fn new(
        canvas_ring_capacity: usize,
        canvas_staleness: std::time::Duration,
        message_history_limit: usize,
        media_config: MediaConfig,
        file_receive_config: FileReceiveConfig,
        canvas_inject_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            canvas: CanvasTracker::new(canvas_ring_capacity, canvas_staleness),
            message_store: MessageStore::new(message_history_limit),
            client_registry: ClientRegistry::new(),
            media: MediaInjector::new(media_config),
            reactions: ReactionCounter::new(),
            file_receive: Arc::new(file_receive_config),
            canvas_inject_url,
            history_limit: message_history_limit,
        })
    }
}

/// Which optional features are active for one connection, mirroring
/// `wsbridge_core::config::FeatureFlags`. Kept independent of the config
/// type so this crate has no dependency-direction surprise.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    pub canvas: bool,
    pub chat_sync: bool,
    pub media_injection: bool,
    pub file_receive: bool,
    pub reaction_counter: bool,
}

/// Per-connection inspector chains plus the handles the engine needs to hold
/// onto outside the chain (for teardown and replay).
pub struct ConnectionInspectors {
    pub client_to_upstream: InspectorChain,
    pub upstream_to_client: InspectorChain,
    pub session: Arc<SessionSlot>,
    pub chat_sync_upstream: Option<Arc<ChatSyncUpstream>>,
    /// `Some` only when canvas is enabled for this connection; the engine
    /// awaits `session.wait_for_key()` and calls `CanvasTracker::replay`
    /// against this handle once the session becomes known (spec.md §4.5).
    pub canvas: Option<Arc<CanvasTracker>>,
}

impl ConnectionInspectors {
    /// Assembles both directions' chains for one new connection. `client_writer`
    /// is this connection's direct-write handle, used by chat-sync's
    /// synthesized history responses and the chat broadcast registry.
    pub fn build(
        state: &PipelineState,
        flags: FeatureFlags,
        client_writer: Arc<dyn DirectWriter>,
    ) -> Self {
        let session = SessionSlot::new();

        let mut upstream_to_client: Vec<Box<dyn Inspector>> = Vec::new();
        let mut client_to_upstream: Vec<Box<dyn Inspector>> = Vec::new();
        let mut chat_sync_upstream = None;

        // Fixed order, client -> upstream: file-receive, reaction-counter, chat-sync.
        if flags.file_receive {
            client_to_upstream.push(Box::new(FileReceiveInspector::new(FileReceiveConfig {
                inbox_dir: state.file_receive.inbox_dir.clone(),
            })));
        }

        if flags.reaction_counter {
            client_to_upstream.push(Box::new(ReactionInspector::new(
                state.reactions.clone(),
                session.clone(),
            )));
        }

        if flags.chat_sync {
            let upstream = ChatSyncUpstream::new(
                session.clone(),
                state.message_store.clone(),
                state.client_registry.clone(),
                client_writer,
            );
            client_to_upstream.push(Box::new(ChatSyncUpstreamHandle(upstream.clone())));
            chat_sync_upstream = Some(upstream);
        }

        // Fixed order, upstream -> client: chat-sync, canvas, media-injector.
        if flags.chat_sync {
            upstream_to_client.push(Box::new(ChatSyncDownstream::new(
                session.clone(),
                state.message_store.clone(),
            )));
        }

        let mut canvas = None;
        if flags.canvas {
            upstream_to_client.push(Box::new(CanvasInspector::new(
                state.canvas.clone(),
                session.clone(),
                state.canvas_inject_url.clone(),
            )));
            canvas = Some(state.canvas.clone());
        }

        if flags.media_injection {
            upstream_to_client.push(Box::new(MediaInjectorAdapter(state.media.clone())));
        }

        Self {
            client_to_upstream: InspectorChain::new(client_to_upstream),
            upstream_to_client: InspectorChain::new(upstream_to_client),
            session,
            chat_sync_upstream,
            canvas,
        }
    }

    /// Called by the engine on connection teardown.
    pub fn teardown(&self) {
        if let Some(upstream) = &self.chat_sync_upstream {
            upstream.unregister();
        }
    }
}

/// `MediaInjector` is process-wide (it owns the run-id table) but needs to
/// implement `Inspector` per chain slot; this just forwards.
struct MediaInjectorAdapter(Arc<MediaInjector>);

#[async_trait::async_trait]
impl Inspector for MediaInjectorAdapter {
    async fn inspect(&self, text: String) -> Option<String> {
        self.0.inspect(text).await
    }

    fn name(&self) -> &'static str {
        "media-injector"
    }
}
