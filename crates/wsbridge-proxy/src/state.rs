use std::sync::{Arc, RwLock};

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use wsbridge_core::registry::ConnectionRegistry;
use wsbridge_core::{ratelimit::RateLimiter, BridgeConfig};
use wsbridge_core::credential::CredentialChecker;
use wsbridge_inspect::{FeatureFlags, FileReceiveConfig, MediaConfig, PipelineState};

pub type HttpClient = Client<HttpConnector, axum::body::Body>;

/// Everything the front door and connection engine share across requests.
/// The config pointer is the single piece that hot-reloads; everything else
/// is built once at startup from the config in effect then (spec.md §9:
/// "non-reloadable fields … require a process restart").
pub struct AppState {
    pub config: RwLock<Arc<BridgeConfig>>,
    pub connections: ConnectionRegistry,
    pub rate_limiter: Arc<RateLimiter>,
    pub credential: CredentialChecker,
    pub pipeline: Arc<PipelineState>,
    pub http_client: HttpClient,
    /// Cancelled on process shutdown; the parent of every connection's
    /// proxy-context cancellation (spec.md §4.2 step 4: the dial's parent
    /// must be process-shutdown, not the HTTP request's own handle).
    pub shutdown: CancellationToken,
    /// Separate process-wide context; cancelling this alone triggers drain
    /// (spec.md §5: "Drain is a separate process-wide context").
    pub drain: CancellationToken,
}

impl AppState {
    pub fn new(config: BridgeConfig, shutdown: CancellationToken, drain: CancellationToken) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(
            config.rate_limit.rate_per_sec,
            config.rate_limit.burst,
            config.rate_limit.max_entries,
            std::time::Duration::from_secs(config.rate_limit.ttl_secs),
        );

        let pipeline = PipelineState::new(
            config.canvas.ring_capacity,
            std::time::Duration::from_secs(config.canvas.staleness_horizon_secs),
            50,
            MediaConfig {
                directory: config.media.directory.clone(),
                allowed_extensions: config.media.allowed_extensions.clone(),
                max_file_size_bytes: config.media.max_file_size_bytes,
                max_age: std::time::Duration::from_secs(config.media.max_age_secs),
                total_budget_bytes: config.max_frame_size as u64,
                allowed_source_dirs: config.media.allowed_source_dirs.clone(),
            },
            FileReceiveConfig {
                inbox_dir: config.inbox_dir.clone(),
            },
            config.canvas.present_inject_url.clone(),
        );

        let http_client: HttpClient =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            connections: ConnectionRegistry::new(),
            rate_limiter,
            credential: CredentialChecker::new(),
            pipeline,
            http_client,
            shutdown,
            drain,
        })
    }

    /// Snapshot the current config; every request pins this for its lifetime
    /// (spec.md §9: "every request re-reads the pointer once at entry").
    pub fn config(&self) -> Arc<BridgeConfig> {
        self.config.read().unwrap().clone()
    }

    pub fn update_config(&self, new: BridgeConfig) -> Vec<&'static str> {
        let current = self.config();
        let diff = current.restart_required_diff(&new);
        *self.config.write().unwrap() = Arc::new(new);
        diff
    }

    pub fn feature_flags(&self, config: &BridgeConfig) -> FeatureFlags {
        FeatureFlags {
            canvas: config.features.canvas,
            chat_sync: config.features.chat_sync,
            media_injection: config.features.media_injection,
            file_receive: config.features.file_receive,
            reaction_counter: config.features.reaction_counter,
        }
    }
}
