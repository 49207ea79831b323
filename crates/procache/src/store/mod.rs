//! # Cache Stores
//!
//! Durable key to artifact mapping. [`FileStore`] keeps entries on the local
//! filesystem and an in-memory index of their metadata.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CacheResult;
use crate::key::CacheKey;

mod file;
mod index;

pub use self::file::{EntryLease, FileStore, StoreStats};

/// Metadata of one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub size_bytes: u64,
    pub last_access: SystemTime,
    /// Monotonic insertion order, used to break recency ties
    pub inserted_seq: u64,
    /// A reader currently holds a lease on the entry
    pub leased: bool,
}

/// Entries captured when [`CacheStore::iterate`] was called. Later writes
/// do not show up in an existing snapshot.
#[derive(Debug)]
pub struct EntrySnapshot {
    entries: std::vec::IntoIter<EntryInfo>,
}

impl EntrySnapshot {
    pub(crate) fn new(entries: Vec<EntryInfo>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for EntrySnapshot {
    type Item = EntryInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for EntrySnapshot {}

/// Outcome of a single eviction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Removed { size: u64 },
    /// A reader holds a lease on the entry
    Leased,
    /// A write or removal of the key is in progress
    InFlight,
    Missing,
}

/// A trait for stores that can persist and retrieve cache entries
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get an entry, refreshing its recency. Corrupt entries are removed and
    /// reported as a miss.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>>;

    /// Durably write an entry. Concurrent writes for one key share a single
    /// storage write.
    async fn put(&self, key: CacheKey, data: Bytes) -> CacheResult<()>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Remove an entry unless it is leased or being written.
    async fn evict(&self, key: &CacheKey) -> CacheResult<Eviction>;

    /// Remove all entries
    async fn clear(&self) -> CacheResult<()>;

    fn contains(&self, key: &CacheKey) -> bool;

    fn size_bytes(&self) -> u64;

    fn entry_count(&self) -> usize;

    /// Snapshot of entry metadata
    fn iterate(&self) -> EntrySnapshot;
}
