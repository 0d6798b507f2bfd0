//! Typed key/value backend
//!
//! The store persists exact-hash markers, rate-limit counters and a few
//! string slots through this small closed set of operations. The in-memory
//! implementation is the default; an external key/value service can be
//! plugged in by implementing [`KeyValueStore`].

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};

/// Typed key/value operations used by the store
pub trait KeyValueStore: Send + Sync {
    /// Read a string slot
    fn get_str(&self, key: &str) -> Option<String>;

    /// Write a string slot
    fn set_str(&self, key: &str, value: &str);

    /// Atomically increment the counter at `key` unless it already reached
    /// `cap`. Returns the new value, or `None` if the cap was hit.
    fn incr_capped(&self, key: &str, cap: i64) -> Option<i64>;

    /// Mark `key` as present. Returns `true` if it was not present before.
    fn mark(&self, key: &str) -> bool;

    /// Check whether `key` is marked
    fn is_marked(&self, key: &str) -> bool;

    /// Remove every key (of any type) starting with `prefix`.
    /// Returns the number of keys removed.
    fn del_prefix(&self, prefix: &str) -> usize;
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryKv {
    strings: DashMap<String, String>,
    counters: DashMap<String, i64>,
    flags: DashSet<String>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of keys held
    pub fn len(&self) -> usize {
        self.strings.len() + self.counters.len() + self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryKv {
    fn get_str(&self, key: &str) -> Option<String> {
        self.strings.get(key).map(|v| v.value().clone())
    }

    fn set_str(&self, key: &str, value: &str) {
        self.strings.insert(key.to_string(), value.to_string());
    }

    fn incr_capped(&self, key: &str, cap: i64) -> Option<i64> {
        // The entry guard holds the shard lock, making compare-and-increment atomic
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let count = entry.get_mut();
                if *count >= cap {
                    None
                } else {
                    *count += 1;
                    Some(*count)
                }
            }
            Entry::Vacant(entry) => {
                if cap <= 0 {
                    return None;
                }
                entry.insert(1);
                Some(1)
            }
        }
    }

    fn mark(&self, key: &str) -> bool {
        self.flags.insert(key.to_string())
    }

    fn is_marked(&self, key: &str) -> bool {
        self.flags.contains(key)
    }

    fn del_prefix(&self, prefix: &str) -> usize {
        // Count inside the closures; writers may add unrelated keys concurrently
        let mut removed = 0usize;
        let mut keep = |key: &String| {
            let matches = key.starts_with(prefix);
            if matches {
                removed += 1;
            }
            !matches
        };
        self.strings.retain(|k, _| keep(k));
        self.counters.retain(|k, _| keep(k));
        self.flags.retain(|k| keep(k));
        removed
    }
}
