use thiserror::Error;

use crate::key::CacheKey;

/// Errors produced by the processed result cache.
///
/// Admission rejections are not errors; see [`crate::AdmissionDecision`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write cache entry {key}: {source}")]
    StorageWriteFailed {
        key: CacheKey,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache entry {key}: {reason}")]
    StorageReadCorrupt { key: CacheKey, reason: String },

    #[error("Budget enforcement left {pending} leased entries in place")]
    BudgetEnforcementFailed { pending: usize },

    #[error("Cache write task aborted: {0}")]
    WriteTaskAborted(String),

    #[error("Invalid cache configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the error came from the underlying storage.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_) | Self::StorageWriteFailed { .. })
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, CacheError>;
