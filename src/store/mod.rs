//! Replicated deduplication store
//!
//! Holds one similarity oracle per job, the exact-hash index (namespaced by
//! job id inside its keys) and the per-host rate limiter. Every local write
//! that changes state is also encoded as a [`PublishMessage`] and queued for
//! asynchronous broadcast; records received from peers are re-applied as
//! local-only writes so they never propagate further.
//!
//! Writes are idempotent, so replaying a record any number of times, in any
//! order, converges to the same state. Peers may act on stale knowledge for
//! a short window, which costs duplicate work but never rejects new content.

mod bus;
mod kv;
mod messages;

pub use bus::LocalBus;
pub use kv::{KeyValueStore, MemoryKv};
pub use messages::{IndexKind, PublishMessage, ReplicationError};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dedup::{rate_limit, ExactIndex, Oracle, RateLimiter};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Rate limiter epoch length
    pub rate_window: Duration,
    /// Hits allowed per host per epoch
    pub rate_max_hits: i64,
    /// Outbound broadcast queue capacity
    pub outbound_capacity: usize,
    /// Inbound record queue capacity
    pub inbound_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            rate_window: rate_limit::DEFAULT_WINDOW,
            rate_max_hits: rate_limit::DEFAULT_MAX_HITS,
            outbound_capacity: 10_000,
            inbound_capacity: 10_000,
        }
    }
}

struct StoreInner {
    node_id: String,
    /// One oracle per job; the map's shard lock serializes access per job
    oracles: DashMap<String, Oracle>,
    exact: ExactIndex,
    limiter: RateLimiter,
    kv: Arc<dyn KeyValueStore>,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
}

/// Channel pair connecting a store to a transport
pub struct ReplicationHandle {
    /// Encoded records to publish to peers
    pub outbound: mpsc::Receiver<Vec<u8>>,
    /// Encoded records received from peers
    pub inbound: mpsc::Sender<Vec<u8>>,
    ingest: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Wait for the ingestion task to finish (after every inbound sender is dropped)
    pub async fn join(self) {
        drop(self.inbound);
        if let Err(e) = self.ingest.await {
            warn!("Replication ingest task failed: {}", e);
        }
    }
}

/// The single writer of a worker's deduplication state
#[derive(Clone)]
pub struct ReplicatedStore {
    inner: Arc<StoreInner>,
}

impl ReplicatedStore {
    /// Create a standalone in-memory store with no replication
    pub fn new(config: StoreConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryKv::new()))
    }

    /// Create a standalone store over the given backend
    pub fn with_backend(config: StoreConfig, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Arc::new(StoreInner::new(config, kv, None)),
        }
    }

    /// Create a store wired for replication.
    ///
    /// Spawns the ingestion task, so this must be called inside a tokio runtime.
    pub fn replicated(
        config: StoreConfig,
        kv: Arc<dyn KeyValueStore>,
    ) -> (Self, ReplicationHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        let inner = Arc::new(StoreInner::new(config, kv, Some(outbound_tx)));
        let ingest = tokio::spawn(Self::ingest(Arc::clone(&inner), inbound_rx));

        let handle = ReplicationHandle {
            outbound: outbound_rx,
            inbound: inbound_tx,
            ingest,
        };
        (Self { inner }, handle)
    }

    async fn ingest(inner: Arc<StoreInner>, mut inbound: mpsc::Receiver<Vec<u8>>) {
        debug!(node = %inner.node_id, "Replication ingest started");
        while let Some(payload) = inbound.recv().await {
            if let Err(e) = inner.apply_remote(&payload) {
                warn!(node = %inner.node_id, "Dropping replication record: {}", e);
            }
        }
        debug!(node = %inner.node_id, "Replication ingest stopped");
    }

    /// Random id identifying this store to its peers
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Record a fingerprint and broadcast the write if it changed anything.
    /// Returns `true` if local state changed.
    pub fn see(&self, scope: &str, kind: IndexKind, fingerprint: u64) -> bool {
        let changed = self.inner.apply(scope, kind, fingerprint);
        if changed {
            self.inner.publish(scope, kind, fingerprint);
        }
        changed
    }

    /// Check whether a fingerprint (or, for the similarity index, anything
    /// strictly within `radius` of it) was recorded. `radius` is ignored for
    /// the exact index.
    pub fn seen(&self, scope: &str, kind: IndexKind, fingerprint: u64, radius: u32) -> bool {
        match kind {
            IndexKind::Similarity => self
                .inner
                .oracles
                .get(scope)
                .map(|oracle| oracle.query(fingerprint, radius))
                .unwrap_or(false),
            IndexKind::Exact => self.inner.exact.seen(scope, fingerprint),
        }
    }

    /// Atomic `seen` followed by `see` when not seen.
    ///
    /// Returns `true` if the fingerprint was already known (a duplicate);
    /// otherwise records and broadcasts it and returns `false`.
    pub fn see_if_unseen(
        &self,
        scope: &str,
        kind: IndexKind,
        fingerprint: u64,
        radius: u32,
    ) -> bool {
        let duplicate = match kind {
            IndexKind::Similarity => {
                let mut oracle = self.inner.oracles.entry(scope.to_string()).or_default();
                if oracle.query(fingerprint, radius) {
                    true
                } else {
                    oracle.insert(fingerprint);
                    false
                }
            }
            IndexKind::Exact => !self.inner.exact.see(scope, fingerprint),
        };

        if !duplicate {
            self.inner.publish(scope, kind, fingerprint);
        }
        duplicate
    }

    /// Consult the rate limiter for `host`
    pub fn allow(&self, host: &str) -> bool {
        self.inner.limiter.allow(host)
    }

    /// Apply an encoded record from a peer without re-broadcasting it.
    /// Returns `true` if local state changed.
    pub fn apply_remote(&self, payload: &[u8]) -> Result<bool, ReplicationError> {
        self.inner.apply_remote(payload)
    }

    /// Forget every exact hash recorded for `scope`. Local only.
    pub fn reset_exact(&self, scope: &str) -> usize {
        self.inner.exact.reset(scope)
    }

    /// Start a fresh crawl session for `host` under `scope`.
    ///
    /// The exact-hash markers of the host's previous session are cleared so
    /// its links can be crawled again; a finished session's similarity
    /// oracle is dropped as well. Local only. Returns the number of exact
    /// markers cleared.
    pub fn begin_session(&self, host: &str, scope: &str) -> usize {
        let key = format!("session/{}", host);
        let cleared = match self.inner.kv.get_str(&key) {
            Some(previous) => {
                if previous != scope {
                    self.inner.oracles.remove(&previous);
                }
                self.reset_exact(&previous)
            }
            None => 0,
        };
        self.inner.kv.set_str(&key, scope);
        cleared
    }

    /// Job scope of the latest session started for `host`
    pub fn session_scope(&self, host: &str) -> Option<String> {
        self.inner.kv.get_str(&format!("session/{}", host))
    }

    /// Remember when `host` last answered a liveness check
    pub fn record_poke(&self, host: &str, at: DateTime<Utc>) {
        self.inner.kv.set_str(&format!("poke/{}", host), &at.to_rfc3339());
    }

    /// When `host` last answered a liveness check
    pub fn last_poke(&self, host: &str) -> Option<DateTime<Utc>> {
        self.inner
            .kv
            .get_str(&format!("poke/{}", host))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Number of distinct page fingerprints recorded for `scope`
    pub fn similarity_len(&self, scope: &str) -> usize {
        self.inner.oracles.get(scope).map(|o| o.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("node_id", &self.inner.node_id)
            .field("jobs", &self.inner.oracles.len())
            .field("replicated", &self.inner.outbound.is_some())
            .finish()
    }
}

impl StoreInner {
    fn new(
        config: StoreConfig,
        kv: Arc<dyn KeyValueStore>,
        outbound: Option<mpsc::Sender<Vec<u8>>>,
    ) -> Self {
        Self {
            node_id: crate::util::random_id(),
            oracles: DashMap::new(),
            exact: ExactIndex::new(Arc::clone(&kv)),
            limiter: RateLimiter::new(Arc::clone(&kv), config.rate_window, config.rate_max_hits),
            kv,
            outbound,
        }
    }

    fn apply(&self, scope: &str, kind: IndexKind, fingerprint: u64) -> bool {
        match kind {
            IndexKind::Similarity => self
                .oracles
                .entry(scope.to_string())
                .or_default()
                .insert(fingerprint),
            IndexKind::Exact => self.exact.see(scope, fingerprint),
        }
    }

    fn apply_remote(&self, payload: &[u8]) -> Result<bool, ReplicationError> {
        let message = PublishMessage::decode(payload)?;
        if message.origin.as_deref() == Some(self.node_id.as_str()) {
            trace!("Ignoring own broadcast");
            return Ok(false);
        }
        let fingerprint = message.fingerprint_value()?;
        Ok(self.apply(&message.scope, message.kind, fingerprint))
    }

    /// Queue a record for broadcast without blocking; drops it if the queue is full
    fn publish(&self, scope: &str, kind: IndexKind, fingerprint: u64) {
        let Some(outbound) = &self.outbound else {
            return;
        };

        let payload = match PublishMessage::see(kind, scope, fingerprint)
            .with_origin(&self.node_id)
            .encode()
        {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode broadcast: {}", e);
                return;
            }
        };

        match outbound.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(scope, %kind, "Outbound replication queue full, dropping broadcast");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(scope, %kind, "No transport attached, broadcast dropped");
            }
        }
    }
}
