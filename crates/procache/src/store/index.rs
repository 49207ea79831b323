//! In-memory index of the entries held by a store.
//!
//! The index is the source of truth for sizes, recency and leases. Its lock
//! is only ever held for metadata updates, never across I/O.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::key::CacheKey;

use super::{EntryInfo, Eviction};

#[derive(Debug, Clone)]
struct IndexedEntry {
    size: u64,
    checksum: String,
    last_access: SystemTime,
    inserted_seq: u64,
    leases: usize,
}

#[derive(Debug)]
struct IndexState {
    entries: HashMap<CacheKey, IndexedEntry>,
    total_bytes: u64,
    next_seq: u64,
    last_stamp: SystemTime,
}

impl IndexState {
    /// Strictly increasing wall clock so two accesses never share a stamp.
    fn stamp(&mut self) -> SystemTime {
        let now = SystemTime::now();
        let next = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + Duration::from_nanos(1)
        };
        self.last_stamp = next;
        next
    }

    fn take(&mut self, key: &CacheKey) -> Option<IndexedEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Size and checksum of a leased entry, plus the generation it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct LeasedEntry {
    pub size: u64,
    pub checksum: String,
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) struct EntryIndex {
    state: Mutex<IndexState>,
}

impl EntryIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState {
                entries: HashMap::new(),
                total_bytes: 0,
                next_seq: 0,
                last_stamp: SystemTime::UNIX_EPOCH,
            }),
        }
    }

    /// Record a freshly written entry, replacing any previous one.
    /// Returns the access stamp given to the entry.
    pub fn insert(&self, key: CacheKey, size: u64, checksum: String) -> SystemTime {
        let mut state = self.state.lock();
        state.take(&key);
        let last_access = state.stamp();
        let inserted_seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += size;
        state.entries.insert(
            key,
            IndexedEntry {
                size,
                checksum,
                last_access,
                inserted_seq,
                leases: 0,
            },
        );
        last_access
    }

    /// Re-register an entry found on disk. Callers restore entries in
    /// insertion order so sequence numbers keep that order.
    pub fn restore(&self, key: CacheKey, size: u64, checksum: String, last_access: SystemTime) {
        let mut state = self.state.lock();
        state.take(&key);
        if last_access > state.last_stamp {
            state.last_stamp = last_access;
        }
        let inserted_seq = state.next_seq;
        state.next_seq += 1;
        state.total_bytes += size;
        state.entries.insert(
            key,
            IndexedEntry {
                size,
                checksum,
                last_access,
                inserted_seq,
                leases: 0,
            },
        );
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Whether the stored entry already holds exactly this payload.
    pub fn matches(&self, key: &CacheKey, size: u64, checksum: &str) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.size == size && e.checksum == checksum)
    }

    pub fn lease(&self, key: &CacheKey) -> Option<LeasedEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.leases += 1;
        Some(LeasedEntry {
            size: entry.size,
            checksum: entry.checksum.clone(),
            generation: entry.inserted_seq,
        })
    }

    /// Release a lease. A lease on a replaced or removed entry is a no-op.
    pub fn release(&self, key: &CacheKey, generation: u64) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.inserted_seq == generation {
                entry.leases = entry.leases.saturating_sub(1);
            }
        }
    }

    /// Refresh recency of the given generation of an entry.
    pub fn touch(&self, key: &CacheKey, generation: u64) -> Option<SystemTime> {
        let mut state = self.state.lock();
        let stamp = state.stamp();
        let entry = state.entries.get_mut(key)?;
        if entry.inserted_seq != generation {
            return None;
        }
        entry.last_access = stamp;
        Some(stamp)
    }

    pub fn remove(&self, key: &CacheKey) -> Option<u64> {
        self.state.lock().take(key).map(|e| e.size)
    }

    /// Remove only if the entry still belongs to `generation`.
    pub fn remove_generation(&self, key: &CacheKey, generation: u64) -> bool {
        let mut state = self.state.lock();
        let current = state
            .entries
            .get(key)
            .is_some_and(|e| e.inserted_seq == generation);
        if current {
            state.take(key);
        }
        current
    }

    pub fn remove_unleased(&self, key: &CacheKey) -> Eviction {
        let mut state = self.state.lock();
        let leased = match state.entries.get(key) {
            None => return Eviction::Missing,
            Some(entry) => entry.leases > 0,
        };
        if leased {
            return Eviction::Leased;
        }
        match state.take(key) {
            Some(entry) => Eviction::Removed { size: entry.size },
            None => Eviction::Missing,
        }
    }

    pub fn clear(&self) -> Vec<CacheKey> {
        let mut state = self.state.lock();
        state.total_bytes = 0;
        state.entries.drain().map(|(key, _)| key).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn snapshot(&self) -> Vec<EntryInfo> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|(key, entry)| EntryInfo {
                key: key.clone(),
                size_bytes: entry.size,
                last_access: entry.last_access,
                inserted_seq: entry.inserted_seq,
                leased: entry.leases > 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{FingerprintKeyer, SourceIdentity, TransformOptions};

    fn key(name: &str) -> CacheKey {
        FingerprintKeyer::new().compute_key(&SourceIdentity::uri(name), &TransformOptions::new())
    }

    #[test]
    fn test_insert_replaces_and_tracks_size() {
        let index = EntryIndex::new();
        index.insert(key("a"), 10, "x".into());
        index.insert(key("b"), 5, "y".into());
        index.insert(key("a"), 3, "z".into());
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_bytes(), 8);
        assert!(index.matches(&key("a"), 3, "z"));
        assert!(!index.matches(&key("a"), 10, "x"));
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let index = EntryIndex::new();
        let first = index.insert(key("a"), 1, "x".into());
        let second = index.insert(key("b"), 1, "x".into());
        assert!(second > first);
    }

    #[test]
    fn test_lease_blocks_eviction_until_released() {
        let index = EntryIndex::new();
        index.insert(key("a"), 10, "x".into());
        let lease = index.lease(&key("a")).unwrap();
        assert_eq!(index.remove_unleased(&key("a")), Eviction::Leased);
        assert!(index.snapshot()[0].leased);

        index.release(&key("a"), lease.generation);
        assert_eq!(
            index.remove_unleased(&key("a")),
            Eviction::Removed { size: 10 }
        );
        assert_eq!(index.remove_unleased(&key("a")), Eviction::Missing);
        assert_eq!(index.total_bytes(), 0);
    }

    #[test]
    fn test_stale_lease_release_ignored() {
        let index = EntryIndex::new();
        index.insert(key("a"), 10, "x".into());
        let old = index.lease(&key("a")).unwrap();
        index.insert(key("a"), 10, "y".into());
        let _new = index.lease(&key("a")).unwrap();

        index.release(&key("a"), old.generation);
        assert_eq!(index.remove_unleased(&key("a")), Eviction::Leased);
        assert!(!index.remove_generation(&key("a"), old.generation));
        assert!(index.touch(&key("a"), old.generation).is_none());
    }
}
