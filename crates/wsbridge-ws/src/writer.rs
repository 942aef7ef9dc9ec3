use async_trait::async_trait;

/// A handle inspectors use to write directly to one end of a connection,
/// bypassing the forwarder's own read/inspect/write cycle — used for
/// cross-device broadcast (chat-sync) and canvas replay.
#[async_trait]
pub trait DirectWriter: Send + Sync {
    async fn send_text(&self, text: String) -> std::io::Result<()>;
}
