//! In-process broadcast transport
//!
//! Connects several replicated stores living in one process. Every record a
//! store publishes is fanned out to all attached stores, including the
//! publisher itself, which discards its own records by origin id.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ReplicationHandle;

/// Broadcast bus shared by the stores of one process
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a store's replication channels to the bus.
    ///
    /// The returned task pumps the store's outbound records onto the bus and
    /// bus records into the store's inbound queue. It runs until the store's
    /// outbound side closes or the task is aborted.
    pub fn attach(&self, handle: ReplicationHandle) -> JoinHandle<()> {
        let ReplicationHandle {
            mut outbound,
            inbound,
            ingest: _ingest,
        } = handle;
        let tx = self.tx.clone();
        let mut rx = self.tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    published = outbound.recv() => match published {
                        Some(payload) => {
                            // No subscribers only happens while shutting down
                            let _ = tx.send(payload);
                        }
                        None => break,
                    },
                    received = rx.recv() => match received {
                        Ok(payload) => {
                            if inbound.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Replication bus lagged, records dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Replication bus pump stopped");
        })
    }

    /// Number of attached stores
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexKind, MemoryKv, ReplicatedStore, StoreConfig};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_writes_propagate_between_stores() {
        let bus = LocalBus::new(64);
        let (a, handle_a) =
            ReplicatedStore::replicated(StoreConfig::default(), Arc::new(MemoryKv::new()));
        let (b, handle_b) =
            ReplicatedStore::replicated(StoreConfig::default(), Arc::new(MemoryKv::new()));
        let pump_a = bus.attach(handle_a);
        let pump_b = bus.attach(handle_b);
        assert_eq!(bus.receiver_count(), 2);

        a.see("job1", IndexKind::Similarity, 0xff);
        b.see("job1", IndexKind::Exact, 12);

        assert!(wait_until(|| b.seen("job1", IndexKind::Similarity, 0xff, 0)).await);
        assert!(wait_until(|| a.seen("job1", IndexKind::Exact, 12, 0)).await);
        assert_eq!(a.similarity_len("job1"), 1);

        pump_a.abort();
        pump_b.abort();
    }
}
