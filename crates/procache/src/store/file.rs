//! # File Store
//!
//! Persists every entry as `<root>/<shard>/<key>` with a JSON sidecar
//! `<key>.meta` holding its size, checksum and creation time. The payload's
//! modification time doubles as the last access time, so recency survives a
//! restart without rewriting the sidecar on every read.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, CacheEventSink};
use crate::key::CacheKey;

use super::index::{EntryIndex, LeasedEntry};
use super::{CacheStore, EntrySnapshot, Eviction};

const META_EXTENSION: &str = "meta";
const TMP_EXTENSION: &str = "tmp";

/// Sidecar stored next to every payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    size: u64,
    checksum: String,
    created_at_ms: u64,
}

/// Cloneable description of a failed write, shared by every joined caller.
#[derive(Debug, Clone)]
struct WriteFailure {
    kind: io::ErrorKind,
    message: String,
    /// The write task panicked or was cancelled
    aborted: bool,
}

impl WriteFailure {
    fn into_error(self, key: CacheKey) -> CacheError {
        if self.aborted {
            CacheError::WriteTaskAborted(self.message)
        } else {
            CacheError::StorageWriteFailed {
                key,
                source: io::Error::new(self.kind, self.message),
            }
        }
    }
}

impl From<&io::Error> for WriteFailure {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            aborted: false,
        }
    }
}

type SharedWrite = Shared<BoxFuture<'static, Result<(), WriteFailure>>>;
type SharedRemoval = Shared<BoxFuture<'static, ()>>;

/// Storage operation in progress for a key.
#[derive(Clone)]
enum Pending {
    Write(SharedWrite),
    Removal(SharedRemoval),
}

impl Pending {
    async fn settled(self) {
        match self {
            Self::Write(write) => {
                let _ = write.await;
            }
            Self::Removal(removal) => removal.await,
        }
    }
}

/// Marks a key as being removed. Puts for the key wait until it drops.
struct RemovalGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    _done: oneshot::Sender<()>,
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.inner.inflight.lock().remove(&self.key);
    }
}

/// Caller holds the `inflight` lock and has checked the key is idle.
fn mark_removal(
    inner: &Arc<Inner>,
    inflight: &mut HashMap<CacheKey, Pending>,
    key: &CacheKey,
) -> RemovalGuard {
    let (done, rx) = oneshot::channel::<()>();
    let removal = async move {
        let _ = rx.await;
    }
    .boxed()
    .shared();
    inflight.insert(key.clone(), Pending::Removal(removal));
    RemovalGuard {
        inner: Arc::clone(inner),
        key: key.clone(),
        _done: done,
    }
}

/// Kinds of file a cache entry is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryFile {
    Payload,
    Meta,
    Temp,
}

/// Shard directories are named by two lowercase hex characters.
fn is_shard(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Recognize `<key>`, `<key>.meta`, `<key>.data.tmp` and `<key>.meta.tmp`.
fn parse_entry_file(name: &str) -> Option<(CacheKey, EntryFile)> {
    let (stem, kind) = match name.split_once('.') {
        None => (name, EntryFile::Payload),
        Some((stem, META_EXTENSION)) => (stem, EntryFile::Meta),
        Some((stem, "data.tmp" | "meta.tmp")) => (stem, EntryFile::Temp),
        Some(_) => return None,
    };
    let key = CacheKey::parse(stem).filter(|k| k.as_str() == stem)?;
    Some((key, kind))
}

#[derive(Debug, Default)]
struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    joined_writes: AtomicU64,
    skipped_writes: AtomicU64,
    evictions: AtomicU64,
    corrupt_removed: AtomicU64,
}

/// Counters since the store was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    /// Writes that reached storage
    pub writes: u64,
    pub write_failures: u64,
    /// Puts that joined a write already in flight
    pub joined_writes: u64,
    /// Puts whose payload was already stored
    pub skipped_writes: u64,
    pub evictions: u64,
    pub corrupt_removed: u64,
}

struct Inner {
    root: PathBuf,
    index: EntryIndex,
    inflight: Mutex<HashMap<CacheKey, Pending>>,
    stats: StatsCounters,
    sink: Arc<dyn CacheEventSink>,
}

/// Filesystem backed [`CacheStore`]. Cloning shares the same store.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.inner.root)
            .field("entries", &self.inner.index.len())
            .field("size_bytes", &self.inner.index.total_bytes())
            .finish()
    }
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed and
    /// rebuilding the index from whatever a previous process left behind.
    pub async fn open(root: impl Into<PathBuf>, sink: Arc<dyn CacheEventSink>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let store = Self {
            inner: Arc::new(Inner {
                root,
                index: EntryIndex::new(),
                inflight: Mutex::new(HashMap::new()),
                stats: StatsCounters::default(),
                sink,
            }),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path of the payload file for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.data_path(key)
    }

    /// Lease an entry so eviction leaves it in place. Returns `None` if the
    /// entry does not exist.
    pub fn lease(&self, key: &CacheKey) -> Option<EntryLease> {
        let entry = self.inner.index.lease(key)?;
        Some(EntryLease {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            entry,
        })
    }

    pub fn stats(&self) -> StoreStats {
        let s = &self.inner.stats;
        StoreStats {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            writes: s.writes.load(Ordering::Relaxed),
            write_failures: s.write_failures.load(Ordering::Relaxed),
            joined_writes: s.joined_writes.load(Ordering::Relaxed),
            skipped_writes: s.skipped_writes.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            corrupt_removed: s.corrupt_removed.load(Ordering::Relaxed),
        }
    }

    async fn recover(&self) -> CacheResult<()> {
        let mut restored: Vec<(u64, CacheKey, EntryMetadata, SystemTime)> = Vec::new();
        let mut shards = fs::read_dir(&self.inner.root).await?;

        while let Some(shard) = shards.next_entry().await? {
            let shard_os_name = shard.file_name();
            let Some(shard_name) = shard_os_name.to_str().filter(|n| is_shard(n)) else {
                continue;
            };
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut payloads: HashMap<CacheKey, PathBuf> = HashMap::new();
            let mut sidecars: Vec<(CacheKey, PathBuf)> = Vec::new();

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if !file.file_type().await?.is_file() {
                    continue;
                }

                match file.file_name().to_str().and_then(parse_entry_file) {
                    Some((key, _)) if key.shard() != shard_name => {
                        debug!(path = ?path, "Ignoring cache file in the wrong shard");
                    }
                    Some((_, EntryFile::Temp)) => {
                        debug!(path = ?path, "Removing leftover temporary file");
                        remove_quietly(&path).await;
                    }
                    Some((key, EntryFile::Meta)) => sidecars.push((key, path)),
                    Some((key, EntryFile::Payload)) => {
                        payloads.insert(key, path);
                    }
                    None => debug!(path = ?path, "Ignoring unknown file in cache directory"),
                }
            }

            for (key, meta_path) in sidecars {
                let payload = payloads.remove(&key);
                let metadata = read_metadata(&meta_path).await;

                let recovered = match (&payload, metadata) {
                    (Some(data_path), Some(metadata)) => match fs::metadata(data_path).await {
                        Ok(attrs) if attrs.len() == metadata.size => {
                            let last_access = attrs.modified().unwrap_or_else(|_| SystemTime::now());
                            Some((metadata, last_access))
                        }
                        _ => None,
                    },
                    _ => None,
                };

                match recovered {
                    Some((metadata, last_access)) => {
                        restored.push((metadata.created_at_ms, key, metadata, last_access));
                    }
                    None => {
                        warn!(key = %key, "Dropping incomplete cache entry");
                        remove_quietly(&meta_path).await;
                        if let Some(data_path) = payload {
                            remove_quietly(&data_path).await;
                        }
                    }
                }
            }

            for (key, orphan) in payloads {
                debug!(key = %key, "Removing payload without metadata");
                remove_quietly(&orphan).await;
            }
        }

        restored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let count = restored.len();
        for (_, key, metadata, last_access) in restored {
            self.inner
                .index
                .restore(key, metadata.size, metadata.checksum, last_access);
        }

        if count > 0 {
            info!(
                root = ?self.inner.root,
                entries = count,
                size_bytes = self.inner.index.total_bytes(),
                "Recovered processed cache entries"
            );
        }
        Ok(())
    }

    fn spawn_write(&self, key: CacheKey, data: Bytes, checksum: String) -> SharedWrite {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let size = data.len() as u64;
            let result = inner.write_entry(&task_key, data, checksum).await;
            inner.inflight.lock().remove(&task_key);

            match result {
                Ok(()) => {
                    inner.stats.writes.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %task_key, size, "Wrote cache entry");
                    Ok(())
                }
                Err(e) => {
                    inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    Err(WriteFailure::from(&e))
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    // The task never reached its own cleanup.
                    inner.inflight.lock().remove(&key);
                    inner.index.remove(&key);
                    Err(WriteFailure {
                        kind: io::ErrorKind::Other,
                        message: format!("{key}: {e}"),
                        aborted: true,
                    })
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn shard_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.shard())
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir(key).join(key.to_filename())
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.shard_dir(key)
            .join(format!("{}.{META_EXTENSION}", key.as_str()))
    }

    fn tmp_path(&self, key: &CacheKey, kind: &str) -> PathBuf {
        self.shard_dir(key)
            .join(format!("{}.{kind}.{TMP_EXTENSION}", key.as_str()))
    }

    async fn write_entry(&self, key: &CacheKey, data: Bytes, checksum: String) -> io::Result<()> {
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);
        let tmp_data = self.tmp_path(key, "data");
        let tmp_meta = self.tmp_path(key, META_EXTENSION);

        let size = data.len() as u64;
        let metadata = EntryMetadata {
            size,
            checksum: checksum.clone(),
            created_at_ms: now_millis(),
        };

        // Write to temporary files first, then rename into place so readers
        // never see a partially written payload.
        let result = async {
            let metadata_json = serde_json::to_vec(&metadata).map_err(io::Error::other)?;
            fs::create_dir_all(self.shard_dir(key)).await?;
            write_synced(&tmp_data, &data).await?;
            write_synced(&tmp_meta, &metadata_json).await?;
            fs::rename(&tmp_data, &data_path).await?;
            fs::rename(&tmp_meta, &meta_path).await?;
            Ok::<(), io::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(key = %key, path = ?data_path, error = %e, "Failed to write cache entry");
            remove_quietly(&tmp_data).await;
            remove_quietly(&tmp_meta).await;
            // Whatever was stored before may now be half replaced.
            self.index.remove(key);
            remove_quietly(&data_path).await;
            remove_quietly(&meta_path).await;
            return Err(e);
        }

        self.index.insert(key.clone(), size, checksum);
        Ok(())
    }

    /// Wait for any pending write or removal of `key`, then claim it for
    /// removal.
    async fn claim_removal(self: &Arc<Self>, key: &CacheKey) -> RemovalGuard {
        loop {
            let pending = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(pending) => pending.clone(),
                    None => return mark_removal(self, &mut inflight, key),
                }
            };
            pending.settled().await;
        }
    }

    async fn remove_files(&self, key: &CacheKey) -> io::Result<()> {
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        let data_result = fs::remove_file(&data_path).await;
        let meta_result = fs::remove_file(&meta_path).await;

        match (data_result, meta_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
                Err(e)
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
                Err(e)
            }
            _ => Ok(()),
        }
    }

    /// Drop an entry whose payload could not be verified. Entries that were
    /// replaced, or are being replaced, while we read them are left alone.
    async fn discard_corrupt(
        self: &Arc<Self>,
        key: &CacheKey,
        generation: u64,
        error: CacheError,
    ) {
        let _removal = {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(key) || !self.index.remove_generation(key, generation) {
                return;
            }
            mark_removal(self, &mut inflight, key)
        };

        let _ = self.remove_files(key).await;
        self.stats.corrupt_removed.fetch_add(1, Ordering::Relaxed);
        let reason = match error {
            CacheError::StorageReadCorrupt { reason, .. } => reason,
            other => other.to_string(),
        };
        self.sink.on_event(CacheEvent::CorruptEntryRemoved {
            key: key.clone(),
            reason,
        });
    }

    /// Record the access time on the payload so it survives a restart.
    fn persist_access(&self, path: PathBuf, stamp: SystemTime) {
        tokio::task::spawn_blocking(move || {
            let result = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_modified(stamp));
            if let Err(e) = result {
                debug!(path = ?path, error = %e, "Failed to record cache access time");
            }
        });
    }
}

/// Pins an entry against eviction until dropped.
///
/// Reads take a lease internally. Callers that open the payload file
/// themselves (see [`FileStore::entry_path`]) can hold one for as long as
/// they need the file.
pub struct EntryLease {
    inner: Arc<Inner>,
    key: CacheKey,
    entry: LeasedEntry,
}

impl EntryLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.entry.size
    }
}

impl std::fmt::Debug for EntryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLease")
            .field("key", &self.key)
            .field("size", &self.entry.size)
            .finish()
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        self.inner.index.release(&self.key, self.entry.generation);
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        let inner = &self.inner;
        let Some(lease) = self.lease(key) else {
            inner.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        let data_path = inner.data_path(key);

        let reason = match fs::read(&data_path).await {
            Ok(bytes) if bytes.len() as u64 != lease.entry.size => format!(
                "size mismatch: expected {} bytes, found {}",
                lease.entry.size,
                bytes.len()
            ),
            Ok(bytes) if checksum_hex(&bytes) != lease.entry.checksum => {
                "checksum mismatch".to_string()
            }
            Ok(bytes) => {
                if let Some(stamp) = inner.index.touch(key, lease.entry.generation) {
                    inner.persist_access(data_path, stamp);
                }
                inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(Bytes::from(bytes)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => "payload file missing".to_string(),
            Err(e) => {
                warn!(path = ?data_path, error = %e, "Failed to read cache data file");
                inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        let generation = lease.entry.generation;
        drop(lease);
        let corrupt = CacheError::StorageReadCorrupt {
            key: key.clone(),
            reason,
        };
        debug!(error = %corrupt, "Cache entry failed verification");
        inner.discard_corrupt(key, generation, corrupt).await;
        inner.stats.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, key: CacheKey, data: Bytes) -> CacheResult<()> {
        let checksum = checksum_hex(&data);
        let size = data.len() as u64;

        let write = loop {
            let removal = {
                let mut inflight = self.inner.inflight.lock();
                match inflight.get(&key) {
                    Some(Pending::Write(existing)) => {
                        self.inner.stats.joined_writes.fetch_add(1, Ordering::Relaxed);
                        break existing.clone();
                    }
                    Some(Pending::Removal(removal)) => removal.clone(),
                    None if self.inner.index.matches(&key, size, &checksum) => {
                        self.inner.stats.skipped_writes.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    None => {
                        let write = self.spawn_write(key.clone(), data, checksum);
                        inflight.insert(key.clone(), Pending::Write(write.clone()));
                        break write;
                    }
                }
            };
            removal.await;
        };

        write.await.map_err(|failure| failure.into_error(key))
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let _removal = self.inner.claim_removal(key).await;
        let existed = self.inner.index.remove(key).is_some();
        self.inner.remove_files(key).await?;
        Ok(existed)
    }

    async fn evict(&self, key: &CacheKey) -> CacheResult<Eviction> {
        let (outcome, removal) = {
            let mut inflight = self.inner.inflight.lock();
            if inflight.contains_key(key) {
                (Eviction::InFlight, None)
            } else {
                let outcome = self.inner.index.remove_unleased(key);
                let removal = matches!(outcome, Eviction::Removed { .. })
                    .then(|| mark_removal(&self.inner, &mut inflight, key));
                (outcome, removal)
            }
        };

        if removal.is_some() {
            self.inner.stats.evictions.fetch_add(1, Ordering::Relaxed);
            // The index no longer references the entry; stray files are
            // cleaned up on the next open.
            let _ = self.inner.remove_files(key).await;
        }
        drop(removal);
        Ok(outcome)
    }

    async fn clear(&self) -> CacheResult<()> {
        let keys = self.inner.index.clear();

        let mut shards = fs::read_dir(&self.inner.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            let is_cache_shard = shard.file_name().to_str().is_some_and(is_shard);
            if !is_cache_shard || !shard.file_type().await?.is_dir() {
                continue;
            }

            let path = shard.path();
            let mut files = fs::read_dir(&path).await?;
            while let Some(file) = files.next_entry().await? {
                let is_entry_file = file.file_name().to_str().and_then(parse_entry_file).is_some();
                if is_entry_file && file.file_type().await?.is_file() {
                    remove_quietly(&file.path()).await;
                }
            }

            // Fails while unrelated files remain in the shard.
            if let Err(e) = fs::remove_dir(&path).await {
                debug!(path = ?path, error = %e, "Keeping cache subdirectory");
            }
        }

        debug!(count = keys.len(), "Cleared cache entries");
        Ok(())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index.contains(key)
    }

    fn size_bytes(&self) -> u64 {
        self.inner.index.total_bytes()
    }

    fn entry_count(&self) -> usize {
        self.inner.index.len()
    }

    fn iterate(&self) -> EntrySnapshot {
        EntrySnapshot::new(self.inner.index.snapshot())
    }
}

fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn read_metadata(path: &Path) -> Option<EntryMetadata> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to read cache metadata file");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to parse cache metadata");
            None
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = ?path, error = %e, "Failed to remove file");
        }
    }
}
