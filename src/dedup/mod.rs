//! Deduplication and rate-limiting indices
//!
//! - `Oracle`: BK-tree answering near-duplicate queries by Hamming distance
//! - `ExactIndex`: scoped membership set of exact hashes
//! - `RateLimiter`: fixed-window hit counter per host
//!
//! The oracle is not synchronized on its own; the replicated store owns one
//! per job and serializes access to it. The exact index and rate limiter
//! rely on the atomic operations of their key/value backend.

pub mod exact;
pub mod oracle;
pub mod rate_limit;

pub use exact::ExactIndex;
pub use oracle::Oracle;
pub use rate_limit::RateLimiter;
