//! Fixed-window hit counter per target host
//!
//! Each host gets a counter per epoch (a fixed-length time bucket). Bursts at
//! window boundaries are possible; stale epoch counters are never purged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::store::KeyValueStore;

/// Default epoch length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default number of hits allowed per host per epoch
pub const DEFAULT_MAX_HITS: i64 = 5;

/// Epoch-bucketed rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    window_secs: i64,
    max_hits: i64,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, window: Duration, max_hits: i64) -> Self {
        Self {
            kv,
            window_secs: (window.as_secs() as i64).max(1),
            max_hits,
        }
    }

    /// Record a hit on `host` now. Returns `false` if the host already used
    /// its budget for the current epoch.
    pub fn allow(&self, host: &str) -> bool {
        self.allow_at(host, Utc::now().timestamp())
    }

    /// Record a hit on `host` at the given unix time
    pub fn allow_at(&self, host: &str, unix_secs: i64) -> bool {
        let key = self.epoch_key(host, unix_secs);
        self.kv.incr_capped(&key, self.max_hits).is_some()
    }

    fn epoch_key(&self, host: &str, unix_secs: i64) -> String {
        let epoch = unix_secs - unix_secs.rem_euclid(self.window_secs);
        format!("rate/{}/{}", host, epoch)
    }

    /// Epoch length
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs as u64)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window_secs", &self.window_secs)
            .field("max_hits", &self.max_hits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryKv::new()), DEFAULT_WINDOW, DEFAULT_MAX_HITS)
    }

    #[test]
    fn test_five_hits_per_epoch() {
        let limiter = limiter();
        let t = 1_700_000_000; // multiple of 5

        for i in 0..5 {
            assert!(limiter.allow_at("example.com", t + (i % 5)), "hit {} should pass", i);
        }
        assert!(!limiter.allow_at("example.com", t + 4));
        assert!(limiter.allow_at("example.com", t + 5));
    }

    #[test]
    fn test_hosts_are_independent() {
        let limiter = limiter();
        let t = 1_700_000_000;
        for _ in 0..5 {
            assert!(limiter.allow_at("a.com", t));
        }
        assert!(!limiter.allow_at("a.com", t));
        assert!(limiter.allow_at("b.com", t));
    }

    #[test]
    fn test_epoch_keys() {
        let limiter = limiter();
        assert_eq!(limiter.epoch_key("h", 12), "rate/h/10");
        assert_eq!(limiter.epoch_key("h", 15), "rate/h/15");
        assert_eq!(limiter.window(), Duration::from_secs(5));
    }

    #[test]
    fn test_allow_uses_wall_clock() {
        let limiter = limiter();
        assert!(limiter.allow("now.example"));
    }
}
