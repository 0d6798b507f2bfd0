//! Configuration for dscan

mod logging;
mod scan;

pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use scan::{DedupConfig, RateLimitConfig, ReplicationConfig, ScanConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::fingerprint::FINGERPRINT_BITS;
use crate::scan::ScanPolicy;
use crate::store::StoreConfig;

/// Default user agent for all HTTP requests
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Known fuzzing engine names
pub const FUZZER_NAMES: &[&str] = &["dummy", "sqlmap", "arachni"];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Fingerprinting and near-duplicate detection
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Per-host rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// State replication between workers
    #[serde(default)]
    pub replication: ReplicationConfig,
    /// Crawl and fuzz pipeline
    #[serde(default)]
    pub scan: ScanConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, format!("# dscan configuration\n\n{}", content))
            .with_context(|| format!("Failed to write config file '{}'", path.display()))?;
        Ok(())
    }

    /// Validate all configuration fields.
    ///
    /// Collects every error and reports them together.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.dedup.shingle_factor == 0 {
            errors.push("shingle_factor must be positive".to_string());
        }
        if self.dedup.similarity_radius > FINGERPRINT_BITS {
            errors.push(format!("similarity_radius must be <= {}", FINGERPRINT_BITS));
        }
        if self.dedup.max_tokens == 0 {
            errors.push("max_tokens must be positive".to_string());
        }

        if self.rate_limit.window_secs == 0 {
            errors.push("rate_limit window_secs must be positive".to_string());
        }
        if self.rate_limit.max_hits <= 0 {
            errors.push("rate_limit max_hits must be positive".to_string());
        }
        if self.rate_limit.backoff_secs == 0 {
            errors.push("rate_limit backoff_secs must be positive".to_string());
        }

        if self.replication.outbound_capacity == 0 {
            errors.push("replication outbound_capacity must be positive".to_string());
        }
        if self.replication.inbound_capacity == 0 {
            errors.push("replication inbound_capacity must be positive".to_string());
        }
        if self.replication.bus_capacity == 0 {
            errors.push("replication bus_capacity must be positive".to_string());
        }

        if self.scan.max_concurrency == 0 {
            errors.push("max_concurrency must be positive".to_string());
        }
        if self.scan.workers == 0 {
            errors.push("workers must be positive".to_string());
        }
        if self.scan.poke_timeout_secs == 0 {
            errors.push("poke_timeout_secs must be positive".to_string());
        }
        if self.scan.render_timeout_secs == 0 {
            errors.push("render_timeout_secs must be positive".to_string());
        }
        for name in &self.scan.fuzzers {
            if !FUZZER_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
                errors.push(format!(
                    "unknown fuzzer '{}' (expected one of: {})",
                    name,
                    FUZZER_NAMES.join(", ")
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }

    /// Store settings derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            rate_window: Duration::from_secs(self.rate_limit.window_secs),
            rate_max_hits: self.rate_limit.max_hits,
            outbound_capacity: self.replication.outbound_capacity,
            inbound_capacity: self.replication.inbound_capacity,
        }
    }

    /// Decision-point tunables derived from this configuration
    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            shingle_factor: self.dedup.shingle_factor,
            similarity_radius: self.dedup.similarity_radius,
            max_tokens: self.dedup.max_tokens,
            backoff: Duration::from_secs(self.rate_limit.backoff_secs),
        }
    }
}
