//! The connection engine (spec.md §4.2): everything that happens to one
//! already-admitted, already-upgraded client connection from dial through
//! teardown.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocket;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use wsbridge_core::BridgeConfig;
use wsbridge_ws::sides::{ClientSink, ClientSource, UpstreamSink, UpstreamSource};
use wsbridge_ws::{CloseCode, FrameSink};

use crate::error::ProxyError;
use crate::forwarder::{self, Direction, ForwarderMetrics, PerMessageLimiter};
use crate::keepalive::{self, Liveness};
use crate::shared_sink::SharedSink;
use crate::state::AppState;

/// Dials upstream with the filtered subprotocols and the configured Origin
/// header, cancelling on `parent` (process-shutdown — never the HTTP
/// request's own handle, which would race the transport per spec.md §4.2
/// step 4).
async fn dial_upstream(
    config: &BridgeConfig,
    subprotocols: &[String],
    parent: &CancellationToken,
) -> Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, ProxyError> {
    let ws_url = config
        .upstream_ws_url()
        .map_err(|e| ProxyError::Dial(e.to_string()))?;

    let mut request = ws_url
        .into_client_request()
        .map_err(|e| ProxyError::Dial(e.to_string()))?;
    request
        .headers_mut()
        .insert("Origin", config.injected_origin.parse().map_err(|_| {
            ProxyError::Dial("configured origin is not a valid header value".to_string())
        })?);
    if !subprotocols.is_empty() {
        let joined = subprotocols.join(", ");
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", joined.parse().map_err(|_| {
                ProxyError::Dial("subprotocol list is not a valid header value".to_string())
            })?);
    }

    let dial = connect_async(request);
    tokio::select! {
        biased;
        _ = parent.cancelled() => Err(ProxyError::Dial("process is shutting down".to_string())),
        result = tokio::time::timeout(config.timeouts.dial(), dial) => {
            match result {
                Ok(Ok((stream, _response))) => Ok(stream),
                Ok(Err(e)) => Err(ProxyError::Dial(e.to_string())),
                Err(_) => Err(ProxyError::Dial("dial timed out".to_string())),
            }
        }
    }
}

/// Ensures a side is closed at most once (spec.md §4.2's "once-latch").
struct OnceClose<D> {
    sink: SharedSink<D>,
    done: AtomicBool,
}

impl<D: FrameSink + Send> OnceClose<D> {
    fn new(sink: SharedSink<D>) -> Self {
        Self {
            sink,
            done: AtomicBool::new(false),
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sink.send_close(code, reason).await;
    }
}

/// Runs one connection end to end: dial, keepalive, drain watcher, inspector
/// chains, forwarders, then teardown. `proxy_ctx` is a child of
/// `state.shutdown`; the caller owns admission accounting (it has already
/// incremented the registry and must decrement it once this returns).
pub async fn run(state: Arc<AppState>, client_ws: WebSocket, peer_ip: IpAddr, subprotocols: Vec<String>) {
    let config = state.config();
    let proxy_ctx = state.shutdown.child_token();
    let started = Instant::now();

    let upstream = match dial_upstream(&config, &subprotocols, &state.shutdown).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(peer = %peer_ip, error = %e, "upstream dial failed");
            let (mut sink, _source) = client_ws.split();
            let _ = sink
                .send(axum::extract::ws::Message::Close(Some(
                    axum::extract::ws::CloseFrame {
                        code: CloseCode::BadGateway.code(),
                        reason: "upstream unreachable".into(),
                    },
                )))
                .await;
            state.connections.decrement(peer_ip);
            return;
        }
    };

    let (client_sink_raw, client_source_raw) = client_ws.split();
    let (upstream_sink_raw, upstream_source_raw) = upstream.split();

    let client_sink = SharedSink::new(ClientSink(client_sink_raw));
    let client_source = ClientSource(client_source_raw);
    let upstream_sink = SharedSink::new(UpstreamSink(upstream_sink_raw));
    let upstream_source = UpstreamSource(upstream_source_raw);

    let client_once = Arc::new(OnceClose::new(client_sink.clone()));

    let flags = state.feature_flags(&config);
    let inspectors = wsbridge_inspect::ConnectionInspectors::build(
        &state.pipeline,
        flags,
        Arc::new(client_sink.clone()),
    );

    let client_liveness = Liveness::new();
    let upstream_liveness = Liveness::new();
    let metrics = ForwarderMetrics::new();

    let per_message_limiter = if config.per_message_rate_limit_enabled {
        Some(Arc::new(PerMessageLimiter::new(
            config.rate_limit.rate_per_sec,
            config.rate_limit.burst as f64,
        )))
    } else {
        None
    };

    let drain_watch = {
        let drain = state.drain.clone();
        let proxy_ctx = proxy_ctx.clone();
        let client_once = client_once.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = drain.cancelled() => {
                    client_once.close(CloseCode::GoingAway.code(), "server shutting down").await;
                    proxy_ctx.cancel();
                }
                _ = proxy_ctx.cancelled() => {}
            }
        })
    };

    let client_keepalive = tokio::spawn(keepalive::run(
        client_sink.clone(),
        client_liveness.clone(),
        config.timeouts.ping_interval(),
        config.timeouts.pong_deadline(),
        proxy_ctx.clone(),
        "client",
    ));
    let upstream_keepalive = tokio::spawn(keepalive::run(
        upstream_sink.clone(),
        upstream_liveness.clone(),
        config.timeouts.ping_interval(),
        config.timeouts.pong_deadline(),
        proxy_ctx.clone(),
        "upstream",
    ));

    // Canvas replay fires once the session key is discovered (spec.md §4.5:
    // "on a new client connecting to a session"); the key itself is only
    // known lazily, from the first chat.send/sessions.history/canvas.* frame
    // (spec.md §9), so this waits for it in the background instead of
    // blocking connection setup on it.
    let canvas_replay = inspectors.canvas.clone().map(|canvas| {
        let session = inspectors.session.clone();
        let client_sink = client_sink.clone();
        let proxy_ctx = proxy_ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = proxy_ctx.cancelled() => {}
                session_key = session.wait_for_key() => {
                    canvas.replay(&session_key, &client_sink).await;
                }
            }
        })
    });

    // Both directions run concurrently on this task rather than spawned,
    // since the inspector chains are borrowed for the duration of the run
    // (spec.md §4.3's per-connection inspector state is not `'static`).
    tokio::join!(
        forwarder::run(
            client_source,
            upstream_sink,
            &inspectors.client_to_upstream,
            proxy_ctx.clone(),
            config.timeouts.write(),
            per_message_limiter,
            metrics.clone(),
            Some(client_liveness),
            Direction::ClientToUpstream,
        ),
        forwarder::run(
            upstream_source,
            client_sink,
            &inspectors.upstream_to_client,
            proxy_ctx.clone(),
            config.timeouts.write(),
            None,
            metrics.clone(),
            Some(upstream_liveness),
            Direction::UpstreamToClient,
        ),
    );

    inspectors.teardown();

    // Client gets a graceful close; the upstream is a same-host component
    // that doesn't benefit from the handshake, so it is simply dropped
    // (spec.md §4.2's close semantics) once `upstream_sink`'s last handle
    // above goes out of scope.
    client_once.close(1000, "connection closed").await;

    drain_watch.abort();
    client_keepalive.abort();
    upstream_keepalive.abort();
    if let Some(replay) = canvas_replay {
        replay.abort();
    }

    state.connections.decrement(peer_ip);
    tracing::info!(
        peer = %peer_ip,
        duration_ms = started.elapsed().as_millis() as u64,
        messages = metrics.total(),
        "connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use wsbridge_ws::Frame;

    struct RecordingSink(Arc<StdMutex<Vec<(u16, String)>>>);

    #[async_trait::async_trait]
    impl FrameSink for RecordingSink {
        async fn send_data(&mut self, _frame: Frame) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_ping(&mut self, _payload: Vec<u8>) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_close(&mut self, code: u16, reason: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push((code, reason.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn once_close_sends_the_close_frame_exactly_once() {
        let closes = Arc::new(StdMutex::new(Vec::new()));
        let sink = SharedSink::new(RecordingSink(closes.clone()));
        let once = OnceClose::new(sink);

        once.close(1000, "first").await;
        once.close(1001, "second").await;

        assert_eq!(*closes.lock().unwrap(), vec![(1000, "first".to_string())]);
    }

    #[tokio::test]
    async fn once_close_is_a_noop_after_drain_beats_teardown_to_it() {
        let closes = Arc::new(StdMutex::new(Vec::new()));
        let sink = SharedSink::new(RecordingSink(closes.clone()));
        let once = Arc::new(OnceClose::new(sink));

        // Simulates the drain watcher racing the normal teardown path: both
        // hold a clone of the same `Arc<OnceClose<_>>` and may call `close`
        // concurrently, but only one send should land.
        let a = once.clone();
        let b = once.clone();
        tokio::join!(
            a.close(1001, "server shutting down"),
            b.close(1000, "connection closed"),
        );

        assert_eq!(closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dial_upstream_fails_fast_when_parent_is_already_cancelled() {
        let config = BridgeConfig::default();
        let parent = CancellationToken::new();
        parent.cancel();

        let result = dial_upstream(&config, &[], &parent).await;
        assert!(matches!(result, Err(ProxyError::Dial(_))));
    }
}
