//! dscan: distributed web-application scanner core
//!
//! Cooperating crawler/fuzzer workers avoid repeating each other's work
//! through a replicated deduplication store:
//! - Exact fingerprints (FNV-1a) recognize already-visited URLs
//! - SimHash fingerprints in a BK-tree recognize near-duplicate pages
//! - Epoch-bucketed counters rate-limit each target host
//! - Every local write is broadcast so peer stores converge

pub mod config;
pub mod dedup;
pub mod fingerprint;
pub mod fuzzer;
pub mod pipeline;
pub mod renderer;
pub mod scan;
pub mod store;
pub mod util;

pub use config::Config;
pub use scan::{Scan, ScanError, ScanGate};
pub use store::{IndexKind, ReplicatedStore};
