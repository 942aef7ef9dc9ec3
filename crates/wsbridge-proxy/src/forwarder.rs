//! The bidirectional forwarding loop (spec.md §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wsbridge_ws::{FrameEvent, FrameSource, InspectorChain};

use crate::keepalive::Liveness;
use crate::shared_sink::SharedSink;

/// Global and per-direction message counters (spec.md §4.4 step 5).
#[derive(Default)]
pub struct ForwarderMetrics {
    total: AtomicU64,
    client_to_upstream: AtomicU64,
    upstream_to_client: AtomicU64,
}

impl ForwarderMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn bump(&self, direction: Direction) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match direction {
            Direction::ClientToUpstream => self.client_to_upstream.fetch_add(1, Ordering::Relaxed),
            Direction::UpstreamToClient => self.upstream_to_client.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn client_to_upstream(&self) -> u64 {
        self.client_to_upstream.load(Ordering::Relaxed)
    }

    pub fn upstream_to_client(&self) -> u64 {
        self.upstream_to_client.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client_to_upstream",
            Direction::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// Per-connection client→upstream message rate limiter (spec.md §3's
/// "optional per-connection message rate limiter" on the connection record).
/// Deliberately separate from the per-IP [`wsbridge_core::ratelimit::RateLimiter`]:
/// this one is scoped to a single connection and never shared.
pub struct PerMessageLimiter {
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
    rate_per_sec: f64,
    burst: f64,
}

impl PerMessageLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            tokens: Mutex::new(burst),
            last_refill: Mutex::new(Instant::now()),
            rate_per_sec,
            burst,
        }
    }

    fn try_take(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_refill.lock().unwrap();
        let mut tokens = self.tokens.lock().unwrap();
        let elapsed = now.duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.burst);
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits for one token. Returns `false` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if self.try_take() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

/// Runs one direction until EOF, a read/write error, or an inspector
/// suppresses the stream into silence forever (never — suppression only
/// skips individual frames). Cancels `proxy_ctx` on the way out regardless
/// of cause, which is what unblocks the peer direction's read.
pub async fn run<S, D>(
    mut source: S,
    sink: SharedSink<D>,
    chain: &InspectorChain,
    proxy_ctx: CancellationToken,
    write_timeout: Duration,
    rate_limiter: Option<Arc<PerMessageLimiter>>,
    metrics: Arc<ForwarderMetrics>,
    liveness: Option<Arc<Liveness>>,
    direction: Direction,
) where
    S: FrameSource,
    D: wsbridge_ws::FrameSink,
{
    loop {
        let event = tokio::select! {
            biased;
            _ = proxy_ctx.cancelled() => break,
            ev = source.recv() => ev,
        };

        let frame = match event {
            Ok(FrameEvent::Data(f)) => f,
            Ok(FrameEvent::Pong(_)) => {
                if let Some(liveness) = &liveness {
                    liveness.note_pong();
                }
                continue;
            }
            Ok(FrameEvent::Closed) => break,
            Err(e) => {
                tracing::debug!(direction = direction.name(), error = %e, "forwarder read failed");
                break;
            }
        };

        if let Some(limiter) = &rate_limiter {
            if !limiter.acquire(&proxy_ctx).await {
                break;
            }
        }

        let Some(out) = chain.run(frame).await else {
            continue;
        };

        let result = tokio::time::timeout(write_timeout, sink.send_data(out)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(direction = direction.name(), error = %e, "forwarder write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(direction = direction.name(), "forwarder write timed out");
                break;
            }
        }

        metrics.bump(direction);
    }

    proxy_ctx.cancel();
}
