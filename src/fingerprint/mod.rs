//! Fingerprints for crawl targets and fetched pages
//!
//! Two families of 64-bit fingerprints are used for deduplication:
//! - Exact structural hashes (FNV-1a) identify an origin, a URL or a full request
//! - A SimHash over shingled HTML structure identifies near-duplicate pages

mod simhash;

pub use simhash::{hash_similarity, structural_features, DEFAULT_MAX_TOKENS};

use serde::{Deserialize, Serialize};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Number of bits in a fingerprint
pub const FINGERPRINT_BITS: u32 = 64;

/// Stable, order-sensitive 64-bit FNV-1a hash of the UTF-8 bytes of `text`
pub fn hash_exact(text: &str) -> u64 {
    hash_bytes(text.as_bytes())
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Number of differing bits between two fingerprints (0..=64)
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// The fingerprints tracked for one scan.
///
/// A zero value means "not computed yet". Values are computed lazily and
/// never recomputed once set, except through [`Fingerprint::reset`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// scheme + host
    pub origin: u64,
    /// origin + path + query
    pub url: u64,
    /// url + body
    pub request: u64,
    /// SimHash of the rendered page structure
    pub response_similarity: u64,
}

impl Fingerprint {
    /// Fill in any request fingerprint that is still zero
    pub fn update_request(&mut self, origin: &str, url: &str, body: &str) {
        if self.origin == 0 {
            self.origin = hash_exact(origin);
        }
        if self.url == 0 {
            self.url = hash_exact(url);
        }
        if self.request == 0 {
            self.request = hash_exact(&format!("{}\n{}", url, body));
        }
    }

    /// Fill in the response fingerprint if it is still zero and a body is present
    pub fn update_response(&mut self, body: &str, shingle_factor: usize, max_tokens: usize) {
        if self.response_similarity == 0 && !body.is_empty() {
            self.response_similarity = hash_similarity(body, shingle_factor, max_tokens);
        }
    }

    /// Clear every cached fingerprint
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
