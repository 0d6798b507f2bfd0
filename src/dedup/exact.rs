//! Exact-match index of previously seen hashes, namespaced by scope

use std::sync::Arc;

use crate::store::KeyValueStore;

/// Membership set of `scope/hash` keys
#[derive(Clone)]
pub struct ExactIndex {
    kv: Arc<dyn KeyValueStore>,
}

impl ExactIndex {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(prefix: &str, hash: u64) -> String {
        format!("{}/{}", prefix, hash)
    }

    /// Record `hash` under `prefix`. Returns `true` if it was not seen before.
    pub fn see(&self, prefix: &str, hash: u64) -> bool {
        self.kv.mark(&Self::key(prefix, hash))
    }

    /// Check whether `hash` was recorded under `prefix`
    pub fn seen(&self, prefix: &str, hash: u64) -> bool {
        self.kv.is_marked(&Self::key(prefix, hash))
    }

    /// Forget every hash recorded under `prefix`.
    ///
    /// Only used when a fresh crawl session starts for a scope.
    pub fn reset(&self, prefix: &str) -> usize {
        self.kv.del_prefix(&format!("{}/", prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn index() -> ExactIndex {
        ExactIndex::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_see_and_seen() {
        let index = index();
        assert!(!index.seen("job1", 42));
        assert!(index.see("job1", 42));
        assert!(index.seen("job1", 42));
        assert!(!index.see("job1", 42));
    }

    #[test]
    fn test_scopes_are_isolated() {
        let index = index();
        index.see("job1", 42);
        assert!(!index.seen("job2", 42));
        assert!(!index.seen("job", 142));
    }

    #[test]
    fn test_reset_only_clears_scope() {
        let index = index();
        index.see("job1", 1);
        index.see("job1", 2);
        index.see("job10", 1);

        assert_eq!(index.reset("job1"), 2);
        assert!(!index.seen("job1", 1));
        assert!(index.seen("job10", 1));
    }
}
