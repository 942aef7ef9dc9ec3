//! Wires the front door, connection engine, and inspector pipeline into one
//! running proxy. Mirrors how the teacher's `nomadflow-server` exposes
//! `build_router`/`init_tracing`/`spawn_signal_handler`/`serve` as its public
//! surface, adapted for this bridge's two cancellation tokens (drain vs hard
//! shutdown), its config hot-reload, and its second, unauthenticated
//! health-probe listener (`build_health_router`).

pub mod admission;
pub mod engine;
pub mod error;
pub mod forwarder;
pub mod keepalive;
pub mod reverseproxy;
pub mod routes;
pub mod shared_sink;
pub mod state;
pub mod subprotocol;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use wsbridge_core::ratelimit::spawn_sweeper;
use wsbridge_core::BridgeConfig;

use crate::state::AppState;

/// Initialize tracing; call once before [`serve`].
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsbridge=info,tower_http=info".into()),
        )
        .init();
}

/// Builds the front-door router. The health probe is deliberately not
/// mounted here: it's served on its own listener (`health_addr`) so it never
/// passes through admission (overlay/credential/rate-limit), matching
/// spec.md §9 naming "health address" as its own restart-requiring bind
/// target rather than a path carved out of the front door.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::ws::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the standalone health-probe router, unauthenticated by design
/// since it's reachable only on `health_addr`, not the public front door.
pub fn build_health_router(state: Arc<AppState>) -> Router {
    routes::health::router().with_state(state)
}

/// Listens for Ctrl+C/SIGTERM to begin drain, and (on unix) SIGHUP to
/// reload config from `config_path`. Drain gives live connections up to
/// `drain_secs` to close themselves before the hard shutdown token fires.
pub fn spawn_signal_handler(
    state: Arc<AppState>,
    drain: CancellationToken,
    shutdown: CancellationToken,
    config_path: Option<PathBuf>,
) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .expect("failed to register SIGHUP handler");
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => { info!("received Ctrl+C, draining…"); break; }
                    _ = sigterm.recv() => { info!("received SIGTERM, draining…"); break; }
                    _ = sighup.recv() => {
                        info!("received SIGHUP, reloading config…");
                        match BridgeConfig::load(config_path.as_deref()) {
                            Ok(new) => {
                                let restart_needed = state.update_config(new);
                                if !restart_needed.is_empty() {
                                    tracing::warn!(fields = ?restart_needed, "config fields changed that require a process restart to take effect");
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "config reload failed, keeping previous config"),
                        }
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received Ctrl+C, draining…");
        }

        let drain_timeout = state.config().timeouts.drain();
        drain.cancel();
        tokio::time::sleep(drain_timeout).await;
        shutdown.cancel();
    });
}

/// Runs the proxy until `shutdown` fires (either directly or via the drain
/// timeout elapsing after `drain` fires). Returns once the listener stops.
pub async fn serve(
    config: BridgeConfig,
    config_path: Option<PathBuf>,
    shutdown: CancellationToken,
    drain: CancellationToken,
) -> std::io::Result<()> {
    let listen_addr = config.listen_addr;
    let health_addr = config.health_addr;
    let state = AppState::new(config, shutdown.clone(), drain.clone());
    spawn_sweeper(state.rate_limiter.clone(), shutdown.clone());
    spawn_signal_handler(state.clone(), drain, shutdown.clone(), config_path);

    let router = build_router(state.clone());
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "wsbridge listening");

    let health_router = build_health_router(state.clone());
    let health_listener = TcpListener::bind(health_addr).await?;
    info!(addr = %health_addr, "health probe listening");
    let health_server = tokio::spawn(
        axum::serve(health_listener, health_router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned()),
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;

    let _ = health_server.await;

    info!("wsbridge stopped");
    Ok(())
}
