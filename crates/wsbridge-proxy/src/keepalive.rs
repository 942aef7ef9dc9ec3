//! Per-side keepalive (spec.md §4.2 step 6, §4.9's "two-timer" note in
//! reverse — this is the one timer liveness relies on). Runs concurrently
//! with that side's reader; reads never time out on their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wsbridge_ws::{CloseCode, FrameSink};

use crate::shared_sink::SharedSink;

/// Bumped by the forwarder loop whenever it observes a `Pong` on this side;
/// keepalive polls it rather than owning the read path itself.
pub struct Liveness(AtomicU64);

impl Liveness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }

    pub fn note_pong(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs until `interval` is zero (disabled), the proxy context cancels, or a
/// pong deadline is missed — in which case it closes `sink` with a
/// keepalive-timeout Going Away frame and cancels the proxy context itself.
pub async fn run<D: FrameSink>(
    sink: SharedSink<D>,
    liveness: Arc<Liveness>,
    interval: Duration,
    pong_deadline: Duration,
    proxy_ctx: CancellationToken,
    side: &'static str,
) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = proxy_ctx.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let before = liveness.snapshot();
        if sink.send_ping(Vec::new()).await.is_err() {
            tracing::debug!(side, "keepalive ping failed to send");
            let _ = sink
                .send_close(CloseCode::GoingAway.code(), "keepalive timeout")
                .await;
            proxy_ctx.cancel();
            return;
        }

        tokio::select! {
            _ = proxy_ctx.cancelled() => return,
            _ = tokio::time::sleep(pong_deadline) => {}
        }

        if liveness.snapshot() == before {
            tracing::warn!(side, "keepalive pong deadline exceeded");
            let _ = sink
                .send_close(CloseCode::GoingAway.code(), "keepalive timeout")
                .await;
            proxy_ctx.cancel();
            return;
        }
    }
}
