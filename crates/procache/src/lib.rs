//! # Procache
//!
//! A disk cache for processed image results, keyed by a fingerprint of the
//! source and every option that changes output pixels.
//!
//! ## Features
//!
//! - Deterministic cache keys from source identity and transform options
//! - Ordered admission rules for decode results
//! - Atomic, checksummed on-disk entries that survive restarts
//! - Byte and entry count budgets with lease aware eviction
//! - Background writes that never block the decode path

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod key;
pub mod processor;
pub mod request;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use admission::{AdmissionDecision, AdmissionPolicy, RejectReason};
pub use cache::ProcessedImageCache;
pub use config::{
    CacheBudget, CacheConfig, CacheConfigBuilder, DefaultUsagePolicy, EvictionOrder, UsagePolicy,
};
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, CacheEventSink, NullSink, TracingSink};
pub use eviction::{EvictionManager, EvictionReport};
pub use key::{
    CacheKey, CropRect, DisplayHints, FingerprintKeyer, OutputFormat, Resize, ResizeMode, Size,
    SourceIdentity, TransformOptions,
};
pub use processor::{ProcessOutcome, ProcessedResultCacheProcessor, WriteReceipt, WriteStatus};
pub use request::{Artifact, DecodeResult, LoadRequest, RasterImage};
pub use store::{CacheStore, EntryInfo, EntryLease, EntrySnapshot, Eviction, FileStore, StoreStats};
