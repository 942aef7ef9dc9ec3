//! Per-IP token-bucket admission, grounded on the teacher's
//! `nomadflow-relay::RelayState::rate_limits: DashMap<IpAddr, Vec<Instant>>`
//! plus its `cleanup_stale_tunnels` background sweeper — generalized here
//! from a sliding-window counter to a token bucket with TTL eviction and a
//! hard cap on tracked IPs.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, rate_per_sec: f64, burst: f64, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(burst);
        self.last_refill = now;
        self.last_seen = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct Params {
    rate_per_sec: f64,
    burst: f64,
    max_entries: usize,
    ttl: Duration,
}

/// A bounded, TTL-evicting per-IP token bucket.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    params: RwLock<Params>,
    refused_new_ip: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32, max_entries: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            buckets: DashMap::new(),
            params: RwLock::new(Params {
                rate_per_sec,
                burst: burst as f64,
                max_entries,
                ttl,
            }),
            refused_new_ip: AtomicU64::new(0),
        })
    }

    /// Consume one token for `ip`. Returns `false` when the bucket is empty,
    /// or when `ip` is new and the map is already at `max_entries` (fail
    /// closed rather than evicting a random existing entry).
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let params = self.params.read().unwrap();
        if let Some(mut bucket) = self.buckets.get_mut(&ip) {
            bucket.refill(params.rate_per_sec, params.burst, now);
            return bucket.try_take();
        }
        if self.buckets.len() >= params.max_entries {
            self.refused_new_ip.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let mut bucket = Bucket::new(params.burst, now);
        let allowed = bucket.try_take();
        self.buckets.insert(ip, bucket);
        allowed
    }

    /// Replace the rate/burst parameters and drop all existing buckets so the
    /// new parameters take effect immediately rather than blending with
    /// whatever tokens were left under the old configuration.
    pub fn update(&self, rate_per_sec: f64, burst: u32) {
        let mut params = self.params.write().unwrap();
        params.rate_per_sec = rate_per_sec;
        params.burst = burst as f64;
        drop(params);
        self.buckets.clear();
    }

    /// Drop entries whose `last_seen` predates the TTL. Intended to be
    /// driven by a periodic background task (see [`spawn_sweeper`]).
    pub fn sweep(&self) {
        let ttl = self.params.read().unwrap().ttl;
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_seen) < ttl);
    }

    pub fn tracked_entries(&self) -> usize {
        self.buckets.len()
    }

    pub fn refused_new_ip_count(&self) -> u64 {
        self.refused_new_ip.load(Ordering::Relaxed)
    }
}

/// Spawn the background sweeper, ticking at ~1 minute, until `shutdown` fires.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => limiter.sweep(),
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_within_burst_then_refuses() {
        let limiter = RateLimiter::new(1.0, 3, 100, Duration::from_secs(600));
        let ip: IpAddr = "100.64.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn caps_tracked_ip_count() {
        let limiter = RateLimiter::new(5.0, 5, 2, Duration::from_secs(600));
        let ip1: IpAddr = "100.64.0.1".parse().unwrap();
        let ip2: IpAddr = "100.64.0.2".parse().unwrap();
        let ip3: IpAddr = "100.64.0.3".parse().unwrap();
        assert!(limiter.allow(ip1));
        assert!(limiter.allow(ip2));
        // map is now at capacity; a brand-new IP must be refused
        assert!(!limiter.allow(ip3));
        assert_eq!(limiter.tracked_entries(), 2);
        assert_eq!(limiter.refused_new_ip_count(), 1);
    }

    #[test]
    fn update_resets_buckets() {
        let limiter = RateLimiter::new(1.0, 1, 100, Duration::from_secs(600));
        let ip: IpAddr = "100.64.0.1".parse().unwrap();
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
        limiter.update(1.0, 5);
        // fresh bucket at full burst after update
        for _ in 0..5 {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }
}
