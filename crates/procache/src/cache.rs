//! # Processed Image Cache
//!
//! Ties the file store, the keyer and eviction together behind one handle
//! built from a [`CacheConfig`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{CacheBudget, CacheConfig, UsagePolicy};
use crate::error::CacheResult;
use crate::events::{CacheEventSink, TracingSink};
use crate::eviction::{EvictionManager, EvictionReport};
use crate::key::{CacheKey, FingerprintKeyer, TransformOptions};
use crate::request::LoadRequest;
use crate::store::{CacheStore, FileStore};

/// Usage policy of a disabled cache.
fn never_usable(_: &TransformOptions) -> bool {
    false
}

pub struct ProcessedImageCache {
    store: Option<FileStore>,
    eviction: EvictionManager,
    keyer: FingerprintKeyer,
    config: CacheConfig,
    sink: Arc<dyn CacheEventSink>,
}

impl ProcessedImageCache {
    /// Open the cache described by `config`, logging events through `tracing`.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        Self::open_with_sink(config, Arc::new(TracingSink)).await
    }

    pub async fn open_with_sink(
        config: CacheConfig,
        sink: Arc<dyn CacheEventSink>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let store = if config.enabled {
            let dir = config.resolved_cache_dir();
            let store = FileStore::open(dir, Arc::clone(&sink)).await?;
            info!(
                root = ?store.root(),
                entries = store.entry_count(),
                size_bytes = store.size_bytes(),
                max_total_bytes = config.budget.max_total_bytes,
                max_entry_count = config.budget.max_entry_count,
                "Processed image cache opened"
            );
            Some(store)
        } else {
            debug!("Processed image cache disabled");
            None
        };

        let cache = Self {
            store,
            eviction: EvictionManager::new(config.eviction_order, Arc::clone(&sink)),
            keyer: FingerprintKeyer::new(),
            config,
            sink,
        };

        // Budget may have shrunk since the directory was last used.
        cache.enforce_budget().await;
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn budget(&self) -> &CacheBudget {
        &self.config.budget
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// The underlying store, or `None` when caching is disabled.
    pub fn store(&self) -> Option<&FileStore> {
        self.store.as_ref()
    }

    pub fn sink(&self) -> Arc<dyn CacheEventSink> {
        Arc::clone(&self.sink)
    }

    /// Usage policy honoring the enabled flag.
    pub fn usage_policy(&self) -> Arc<dyn UsagePolicy> {
        if self.is_enabled() {
            Arc::clone(&self.config.usage)
        } else {
            Arc::new(never_usable)
        }
    }

    pub fn can_use(&self, options: &TransformOptions) -> bool {
        self.is_enabled() && self.config.usage.can_use(options)
    }

    pub fn key_for(&self, request: &LoadRequest) -> CacheKey {
        self.keyer.compute_key(&request.source, &request.options)
    }

    /// Look up the processed result for a request.
    pub async fn get(&self, request: &LoadRequest) -> CacheResult<Option<Bytes>> {
        if !self.can_use(&request.options) {
            return Ok(None);
        }
        self.get_by_key(&self.key_for(request)).await
    }

    pub async fn get_by_key(&self, key: &CacheKey) -> CacheResult<Option<Bytes>> {
        match &self.store {
            Some(store) => store.get(key).await,
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store.as_ref().is_some_and(|s| s.contains(key))
    }

    /// Write an entry and bring the cache back within budget.
    pub async fn save(&self, key: CacheKey, data: Bytes) -> CacheResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.put(key, data).await?;
        self.eviction
            .enforce_budget(store, &self.config.budget)
            .await;
        Ok(())
    }

    /// Drop the cached result of a request, e.g. after its source changed.
    pub async fn invalidate(&self, request: &LoadRequest) -> CacheResult<bool> {
        self.remove(&self.key_for(request)).await
    }

    pub async fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        match &self.store {
            Some(store) => store.remove(key).await,
            None => Ok(false),
        }
    }

    pub async fn clear(&self) -> CacheResult<()> {
        match &self.store {
            Some(store) => store.clear().await,
            None => Ok(()),
        }
    }

    pub async fn enforce_budget(&self) -> EvictionReport {
        match &self.store {
            Some(store) => {
                self.eviction
                    .enforce_budget(store, &self.config.budget)
                    .await
            }
            None => EvictionReport {
                within_budget: true,
                ..Default::default()
            },
        }
    }

    /// Start a background task enforcing the budget every `interval`.
    pub fn start_maintenance_task(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let report = self.enforce_budget().await;
                if !report.within_budget {
                    warn!(
                        pending = report.pending,
                        "Cache maintenance could not reach the budget"
                    );
                }
            }
        })
    }

    /// Start the maintenance task if the configuration asks for one.
    pub fn start_configured_maintenance(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.maintenance_interval?;
        if !self.is_enabled() {
            return None;
        }
        Some(Arc::clone(self).start_maintenance_task(interval))
    }
}

impl std::fmt::Debug for ProcessedImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedImageCache")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Resize, SourceIdentity};
    use crate::test_utils::init_tracing;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CacheConfig {
        CacheConfig::builder()
            .with_cache_dir(dir.path())
            .with_budget(CacheBudget::new(1500, 10))
            .build()
    }

    fn request(name: &str) -> LoadRequest {
        LoadRequest::new(
            SourceIdentity::uri(name),
            TransformOptions::new().with_resize(Resize::new(100, 100)),
        )
    }

    #[tokio::test]
    async fn test_save_enforces_budget() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cache = ProcessedImageCache::open(config(&dir)).await.unwrap();

        let a = cache.key_for(&request("A"));
        let b = cache.key_for(&request("B"));
        cache.save(a.clone(), Bytes::from(vec![1; 1000])).await.unwrap();
        cache.save(b.clone(), Bytes::from(vec![2; 1000])).await.unwrap();

        assert!(cache.get(&request("A")).await.unwrap().is_none());
        assert_eq!(
            cache.get(&request("B")).await.unwrap(),
            Some(Bytes::from(vec![2; 1000]))
        );
    }

    #[tokio::test]
    async fn test_reopen_with_smaller_budget_evicts() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        {
            let cache = ProcessedImageCache::open(config(&dir)).await.unwrap();
            for name in ["x", "y", "z"] {
                let key = cache.key_for(&request(name));
                cache.save(key, Bytes::from(vec![0; 100])).await.unwrap();
            }
        }

        let smaller = CacheConfig::builder()
            .with_cache_dir(dir.path())
            .with_budget(CacheBudget::new(1500, 2))
            .build();
        let cache = ProcessedImageCache::open(smaller).await.unwrap();
        assert_eq!(cache.store().unwrap().entry_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let dir = TempDir::new().unwrap();
        let disabled = CacheConfig::builder()
            .with_cache_dir(dir.path().join("never"))
            .with_enabled(false)
            .build();
        let cache = ProcessedImageCache::open(disabled).await.unwrap();

        let key = cache.key_for(&request("a"));
        cache.save(key.clone(), Bytes::from_static(b"x")).await.unwrap();

        assert!(!cache.is_enabled());
        assert!(!cache.can_use(&request("a").options));
        assert!(!cache.contains(&key));
        assert!(cache.get_by_key(&key).await.unwrap().is_none());
        assert!(!dir.path().join("never").exists());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let dir = TempDir::new().unwrap();
        let cache = ProcessedImageCache::open(config(&dir)).await.unwrap();
        let req = request("changed");
        cache
            .save(cache.key_for(&req), Bytes::from_static(b"old"))
            .await
            .unwrap();

        assert!(cache.invalidate(&req).await.unwrap());
        assert!(cache.get(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_during_write_removes_result() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig::builder()
            .with_cache_dir(dir.path())
            .with_budget(CacheBudget::new(64 * 1024 * 1024, 10))
            .build();
        let cache = Arc::new(ProcessedImageCache::open(config).await.unwrap());
        let req = request("stale");
        let key = cache.key_for(&req);

        let save = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            let data = Bytes::from(vec![3u8; 4 * 1024 * 1024]);
            tokio::spawn(async move { cache.save(key, data).await })
        };
        // Single threaded runtime: the save registers its write before we resume.
        tokio::task::yield_now().await;

        assert!(cache.invalidate(&req).await.unwrap());
        save.await.unwrap().unwrap();

        assert!(!cache.contains(&key));
        assert!(cache.get(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_maintenance_task_enforces_budget() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ProcessedImageCache::open(config(&dir)).await.unwrap());
        let store = cache.store().unwrap().clone();

        // Bypass the facade so nothing enforces the budget on write.
        for name in ["p", "q", "r"] {
            store
                .put(cache.key_for(&request(name)), Bytes::from(vec![0; 1000]))
                .await
                .unwrap();
        }
        assert_eq!(store.entry_count(), 3);

        let handle = Arc::clone(&cache).start_maintenance_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        assert_eq!(store.entry_count(), 1);
        assert!(store.size_bytes() <= 1500);
    }
}
