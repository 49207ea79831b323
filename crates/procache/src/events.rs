//! # Cache Events
//!
//! Fire-and-forget notifications about writes and evictions.

use tracing::{debug, info, warn};

use crate::key::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    WriteCompleted { key: CacheKey, size: u64 },
    WriteFailed { key: CacheKey, error: String },
    Evicted { key: CacheKey, size: u64 },
    /// Eviction skipped an entry that was being read
    EvictionDeferred { key: CacheKey },
    /// Budget could not be met because the remaining candidates were leased
    BudgetEnforcementFailed { pending: usize },
    CorruptEntryRemoved { key: CacheKey, reason: String },
}

/// Receives cache events for logging or metrics.
pub trait CacheEventSink: Send + Sync {
    fn on_event(&self, event: CacheEvent);
}

/// Default sink that forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl CacheEventSink for TracingSink {
    fn on_event(&self, event: CacheEvent) {
        match event {
            CacheEvent::WriteCompleted { key, size } => {
                debug!(key = %key, size, "Processed result cached");
            }
            CacheEvent::WriteFailed { key, error } => {
                warn!(key = %key, error = %error, "Failed to cache processed result");
            }
            CacheEvent::Evicted { key, size } => {
                debug!(key = %key, size, "Evicted cache entry");
            }
            CacheEvent::EvictionDeferred { key } => {
                debug!(key = %key, "Eviction deferred, entry is leased");
            }
            CacheEvent::BudgetEnforcementFailed { pending } => {
                info!(pending, "Cache still over budget, leased entries will be retried");
            }
            CacheEvent::CorruptEntryRemoved { key, reason } => {
                warn!(key = %key, reason = %reason, "Removed corrupt cache entry");
            }
        }
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl CacheEventSink for NullSink {
    fn on_event(&self, _event: CacheEvent) {}
}
