//! Similarity index over 64-bit fingerprints
//!
//! A BK-tree keyed by Hamming distance. Each node keeps one child slot per
//! possible distance (0..=64); a child in slot `d` sits at exactly distance
//! `d` from its parent. Range queries use the triangle inequality to skip
//! subtrees that cannot hold a fingerprint within the query radius.

use crate::fingerprint::{hamming_distance, FINGERPRINT_BITS};

const SLOTS: usize = FINGERPRINT_BITS as usize + 1;

struct OracleNode {
    fingerprint: u64,
    children: [Option<Box<OracleNode>>; SLOTS],
}

impl OracleNode {
    fn new(fingerprint: u64) -> Box<Self> {
        Box::new(Self {
            fingerprint,
            children: std::array::from_fn(|_| None),
        })
    }
}

/// Answers "has anything this close been seen before?"
///
/// Grows monotonically; nodes are never removed or rebalanced.
#[derive(Default)]
pub struct Oracle {
    root: Option<Box<OracleNode>>,
    len: usize,
}

impl Oracle {
    /// Create an empty oracle
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fingerprint. Returns `false` if it was already present.
    pub fn insert(&mut self, fingerprint: u64) -> bool {
        let mut node: &mut OracleNode = match &mut self.root {
            Some(root) => root,
            slot @ None => {
                *slot = Some(OracleNode::new(fingerprint));
                self.len = 1;
                return true;
            }
        };

        loop {
            let d = hamming_distance(node.fingerprint, fingerprint) as usize;
            if d == 0 {
                return false;
            }
            match &mut node.children[d] {
                Some(child) => node = child,
                slot @ None => {
                    *slot = Some(OracleNode::new(fingerprint));
                    self.len += 1;
                    return true;
                }
            }
        }
    }

    /// Check whether any recorded fingerprint lies strictly within `radius`
    /// of `fingerprint`. An exact hit always matches, even at radius 0.
    pub fn query(&self, fingerprint: u64, radius: u32) -> bool {
        let Some(root) = self.root.as_deref() else {
            return false;
        };

        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            let d = hamming_distance(node.fingerprint, fingerprint);
            if d == 0 || d < radius {
                return true;
            }

            let low = d.saturating_sub(radius) as usize;
            let high = (d + radius).min(FINGERPRINT_BITS) as usize;
            for slot in low..=high {
                if let Some(child) = node.children[slot].as_deref() {
                    stack.push(child);
                }
            }
        }

        false
    }

    /// Number of distinct fingerprints recorded
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Oracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oracle").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_oracle_matches_nothing() {
        let oracle = Oracle::new();
        assert!(!oracle.query(0, 2));
        assert!(!oracle.query(u64::MAX, 64));
        assert!(oracle.is_empty());
    }

    #[test]
    fn test_insert_then_query_exact() {
        let mut oracle = Oracle::new();
        assert!(oracle.insert(0xdead_beef));
        assert!(oracle.query(0xdead_beef, 0));
        assert!(oracle.query(0xdead_beef, 2));
        assert!(!oracle.insert(0xdead_beef));
        assert_eq!(oracle.len(), 1);
    }

    #[test]
    fn test_radius_is_strict() {
        let mut oracle = Oracle::new();
        oracle.insert(0);

        assert!(oracle.query(0b1, 2)); // distance 1
        assert!(!oracle.query(0b11, 2)); // distance 2
        assert!(oracle.query(0b11, 3));
    }

    #[test]
    fn test_children_follow_distance_slots() {
        let mut oracle = Oracle::new();
        oracle.insert(0);
        oracle.insert(0b1); // slot 1 under root
        oracle.insert(0b10); // slot 1 again, recurses into 0b1 (distance 2)
        oracle.insert(0b111); // slot 3

        let root = oracle.root.as_deref().unwrap();
        let first = root.children[1].as_deref().unwrap();
        assert_eq!(first.fingerprint, 0b1);
        assert_eq!(first.children[2].as_deref().unwrap().fingerprint, 0b10);
        assert_eq!(root.children[3].as_deref().unwrap().fingerprint, 0b111);
        assert_eq!(oracle.len(), 4);
    }

    #[test]
    fn test_query_finds_deep_nodes() {
        let mut oracle = Oracle::new();
        let values: Vec<u64> = (0..500u64)
            .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15))
            .collect();
        for v in &values {
            oracle.insert(*v);
        }

        for v in &values {
            assert!(oracle.query(*v, 0));
            // Flip one bit: still within radius 2
            assert!(oracle.query(v ^ (1 << 17), 2));
        }
    }

    #[test]
    fn test_query_agrees_with_linear_scan() {
        let mut oracle = Oracle::new();
        let values: Vec<u64> = (1..200u64)
            .map(|i| i.wrapping_mul(0xbf58_476d_1ce4_e5b9) >> (i % 7))
            .collect();
        for v in &values {
            oracle.insert(*v);
        }

        let probes: Vec<u64> = (0..200u64).map(|i| i.wrapping_mul(0x94d0_49bb_1331_11eb)).collect();
        for probe in probes {
            for radius in [1u32, 4, 12, 24] {
                let expected = values
                    .iter()
                    .any(|v| hamming_distance(*v, probe) < radius || *v == probe);
                assert_eq!(
                    oracle.query(probe, radius),
                    expected,
                    "query {:x} radius {}",
                    probe,
                    radius
                );
            }
        }
    }
}
