//! Deduplication, rate limiting, replication and scan configuration

use serde::{Deserialize, Serialize};

use super::DEFAULT_USER_AGENT;
use crate::fingerprint::DEFAULT_MAX_TOKENS;

/// Fingerprinting and near-duplicate detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Shingle width for page fingerprints
    pub shingle_factor: usize,
    /// Pages closer than this many bits to a seen page are duplicates
    pub similarity_radius: u32,
    /// Maximum markup tokens fingerprinted per page
    pub max_tokens: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            shingle_factor: 3,
            similarity_radius: 2,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Per-host rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Epoch length (seconds)
    pub window_secs: u64,
    /// Hits allowed per host per epoch
    pub max_hits: i64,
    /// Delay before retrying a rate-limited scan (seconds)
    pub backoff_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            max_hits: 5,
            backoff_secs: 5,
        }
    }
}

/// State replication between workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Broadcast store writes even with a single worker
    pub enabled: bool,
    /// Outbound broadcast queue capacity per store
    pub outbound_capacity: usize,
    /// Inbound record queue capacity per store
    pub inbound_capacity: usize,
    /// In-process bus capacity
    pub bus_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            outbound_capacity: 10_000,
            inbound_capacity: 10_000,
            bus_capacity: 10_000,
        }
    }
}

/// Crawl and fuzz pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Maximum concurrent crawl tasks
    pub max_concurrency: usize,
    /// In-process workers, each with its own store
    pub workers: usize,
    /// Liveness check timeout (seconds)
    pub poke_timeout_secs: u64,
    /// Page render timeout (seconds)
    pub render_timeout_secs: u64,
    /// Stop when the seed does not answer the liveness check
    pub skip_unreachable: bool,
    /// User agent for all requests
    pub user_agent: String,
    /// Fuzzing engines to run on unique pages
    pub fuzzers: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            workers: 1,
            poke_timeout_secs: 3,
            render_timeout_secs: 10,
            skip_unreachable: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fuzzers: vec!["dummy".to_string()],
        }
    }
}
