use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub drain_secs: u64,
    pub dial_secs: u64,
    pub write_secs: u64,
    /// Reserved: spec.md's data model names a per-frame read timeout, but the
    /// forwarder deliberately never arms one — keepalive is the sole
    /// liveness signal (see design notes). Kept so a host config file that
    /// sets it doesn't fail validation; unused by the engine.
    pub read_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_deadline_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            drain_secs: 10,
            dial_secs: 5,
            write_secs: 10,
            read_secs: 0,
            ping_interval_secs: 30,
            pong_deadline_secs: 10,
        }
    }
}

impl TimeoutsConfig {
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }
    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn pong_deadline(&self) -> Duration {
        Duration::from_secs(self.pong_deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained tokens per second.
    pub rate_per_sec: f64,
    pub burst: u32,
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_per_sec: 5.0,
            burst: 20,
            max_entries: 10_000,
            ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    pub max_global: usize,
    pub max_per_ip: usize,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_global: 1000,
            max_per_ip: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub directory: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    pub max_age_secs: u64,
    pub inject_path_prefixes: Vec<String>,
    pub allowed_source_dirs: Vec<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./media"),
            allowed_extensions: vec![
                "png".into(),
                "jpg".into(),
                "jpeg".into(),
                "gif".into(),
                "webp".into(),
                "pdf".into(),
                "txt".into(),
            ],
            max_file_size_bytes: 10 * 1024 * 1024,
            max_age_secs: 120,
            inject_path_prefixes: Vec::new(),
            allowed_source_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    pub ring_capacity: usize,
    pub staleness_horizon_secs: u64,
    /// When set, injected into `canvas.present` params' `url` field on the
    /// way to the client.
    pub present_inject_url: Option<String>,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 64,
            staleness_horizon_secs: 3600,
            present_inject_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub canvas: bool,
    pub chat_sync: bool,
    pub media_injection: bool,
    pub file_receive: bool,
    pub reaction_counter: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            canvas: true,
            chat_sync: true,
            media_injection: true,
            file_receive: true,
            reaction_counter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub upstream_url: String,
    pub injected_origin: String,
    pub max_frame_size: usize,
    pub allowed_subprotocols: Vec<String>,
    pub public_path_prefixes: Vec<String>,
    pub credential_token: Option<String>,
    pub overlay_enabled: bool,
    pub inbox_dir: PathBuf,
    #[serde(default = "default_true")]
    pub per_message_rate_limit_enabled: bool,
    pub timeouts: TimeoutsConfig,
    pub rate_limit: RateLimitConfig,
    pub capacity: CapacityConfig,
    pub media: MediaConfig,
    pub canvas: CanvasConfig,
    pub features: FeatureFlags,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".parse().unwrap(),
            health_addr: "127.0.0.1:8788".parse().unwrap(),
            upstream_url: "http://127.0.0.1:3000".to_string(),
            injected_origin: "http://127.0.0.1:3000".to_string(),
            max_frame_size: 16 * 1024 * 1024,
            allowed_subprotocols: Vec::new(),
            public_path_prefixes: Vec::new(),
            credential_token: None,
            overlay_enabled: true,
            inbox_dir: PathBuf::from("./inbox"),
            per_message_rate_limit_enabled: false,
            timeouts: TimeoutsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            capacity: CapacityConfig::default(),
            media: MediaConfig::default(),
            canvas: CanvasConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file, falling back to defaults if `path` is `None`.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text).map_err(|e| BridgeError::Config(e.to_string()))?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_url.is_empty() {
            return Err(BridgeError::Config("upstream_url must not be empty".into()));
        }
        if !self.upstream_url.starts_with("http://") && !self.upstream_url.starts_with("https://") {
            return Err(BridgeError::Config(
                "upstream_url must be http(s)://".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(BridgeError::Config("max_frame_size must be > 0".into()));
        }
        Ok(())
    }

    /// Derive the upstream WebSocket URL (`http`→`ws`, `https`→`wss`).
    pub fn upstream_ws_url(&self) -> Result<String> {
        if let Some(rest) = self.upstream_url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = self.upstream_url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(BridgeError::Config(format!(
                "cannot derive ws:// scheme from {}",
                self.upstream_url
            )))
        }
    }

    /// Names the fields that differ between `self` and `other` which require a
    /// process restart to take effect (listen address, upstream URL, health
    /// address — TLS is out of scope for this core but named for parity with
    /// spec.md §9's restart-comparator requirement).
    pub fn restart_required_diff(&self, other: &BridgeConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.listen_addr != other.listen_addr {
            changed.push("listen_addr");
        }
        if self.health_addr != other.health_addr {
            changed.push("health_addr");
        }
        if self.upstream_url != other.upstream_url {
            changed.push("upstream_url");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn upstream_ws_url_translates_scheme() {
        let mut cfg = BridgeConfig::default();
        cfg.upstream_url = "https://gateway.local:9443".to_string();
        assert_eq!(cfg.upstream_ws_url().unwrap(), "wss://gateway.local:9443");
        cfg.upstream_url = "http://gateway.local:9000".to_string();
        assert_eq!(cfg.upstream_ws_url().unwrap(), "ws://gateway.local:9000");
    }

    #[test]
    fn rejects_empty_upstream() {
        let mut cfg = BridgeConfig::default();
        cfg.upstream_url = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn restart_diff_names_changed_fields() {
        let a = BridgeConfig::default();
        let mut b = a.clone();
        b.upstream_url = "http://other:1234".to_string();
        let diff = a.restart_required_diff(&b);
        assert_eq!(diff, vec!["upstream_url"]);
    }
}
