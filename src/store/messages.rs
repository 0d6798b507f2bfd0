//! Replication records exchanged between peer stores

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation name carried by every record
pub const OP_SEE: &str = "see";

/// Which index a record targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Similarity index (near-duplicate pages)
    #[serde(alias = "oracle")]
    Similarity,
    /// Exact index (seen URLs)
    #[serde(alias = "hash")]
    Exact,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Similarity => "similarity",
            Self::Exact => "exact",
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors decoding an inbound record
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Malformed record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
    #[error("Invalid fingerprint text: {0}")]
    InvalidFingerprint(String),
}

/// A broadcast record: `{operation, kind, scope, fingerprint}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub operation: String,
    pub kind: IndexKind,
    pub scope: String,
    /// Fingerprint as decimal text
    pub fingerprint: String,
    /// Node id of the publishing store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl PublishMessage {
    pub fn see(kind: IndexKind, scope: &str, fingerprint: u64) -> Self {
        Self {
            operation: OP_SEE.to_string(),
            kind,
            scope: scope.to_string(),
            fingerprint: fingerprint.to_string(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, node_id: &str) -> Self {
        self.origin = Some(node_id.to_string());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a record
    pub fn decode(payload: &[u8]) -> Result<Self, ReplicationError> {
        let message: Self = serde_json::from_slice(payload)?;
        if !message.operation.eq_ignore_ascii_case(OP_SEE) {
            return Err(ReplicationError::UnknownOperation(message.operation));
        }
        Ok(message)
    }

    /// Parse the fingerprint text
    pub fn fingerprint_value(&self) -> Result<u64, ReplicationError> {
        self.fingerprint
            .parse::<u64>()
            .map_err(|_| ReplicationError::InvalidFingerprint(self.fingerprint.clone()))
    }
}
