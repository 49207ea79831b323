//! # Processed Result Processor
//!
//! Hook invoked once a decode finishes. Admitted results are written in the
//! background so the caller never waits on storage.

use std::sync::Arc;

use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::admission::{AdmissionDecision, AdmissionPolicy, RejectReason};
use crate::cache::ProcessedImageCache;
use crate::events::{CacheEvent, CacheEventSink};
use crate::key::CacheKey;
use crate::request::{DecodeResult, LoadRequest};

/// Final state of a background write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Stored,
    Failed(String),
}

/// Handle to a scheduled write.
#[derive(Debug)]
pub struct WriteReceipt {
    key: CacheKey,
    rx: oneshot::Receiver<WriteStatus>,
}

impl WriteReceipt {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the write to finish. Returns `None` when the request was
    /// cancelled, even though the write itself still ran.
    pub async fn wait(self) -> Option<WriteStatus> {
        self.rx.await.ok()
    }
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Rejected(RejectReason),
    Scheduled(WriteReceipt),
}

impl ProcessOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled(_))
    }
}

pub struct ProcessedResultCacheProcessor {
    cache: Arc<ProcessedImageCache>,
    admission: AdmissionPolicy,
    sink: Arc<dyn CacheEventSink>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    maintenance: Option<JoinHandle<()>>,
}

impl ProcessedResultCacheProcessor {
    /// Must be called from within a Tokio runtime when the cache configures a
    /// maintenance interval; the periodic budget pass runs until the
    /// processor is dropped.
    pub fn new(cache: Arc<ProcessedImageCache>) -> Self {
        let admission = AdmissionPolicy::new(cache.usage_policy());
        let permits = Arc::new(Semaphore::new(cache.config().write_concurrency));
        let maintenance = cache.start_configured_maintenance();
        Self {
            sink: cache.sink(),
            cache,
            admission,
            permits,
            tasks: TaskTracker::new(),
            maintenance,
        }
    }

    pub fn cache(&self) -> &Arc<ProcessedImageCache> {
        &self.cache
    }

    /// Inspect a finished decode and schedule a write if it is admitted.
    ///
    /// Must be called from within a Tokio runtime. Never blocks on I/O and
    /// never fails; storage errors surface as [`CacheEvent::WriteFailed`].
    pub fn on_decode_complete(
        &self,
        request: &LoadRequest,
        result: &DecodeResult,
    ) -> ProcessOutcome {
        if let AdmissionDecision::Reject(reason) = self.admission.should_cache(result, request) {
            trace!(
                source = ?request.source,
                artifact = result.artifact.kind(),
                %reason,
                "Decode result not cached"
            );
            return ProcessOutcome::Rejected(reason);
        }
        let Some(image) = result.raster_image() else {
            return ProcessOutcome::Rejected(RejectReason::NotRaster);
        };

        let key = self.cache.key_for(request);
        let data = image.data.clone();
        let cancel = request.cancellation_token();
        let (tx, rx) = oneshot::channel();

        let cache = Arc::clone(&self.cache);
        let sink = Arc::clone(&self.sink);
        let permits = Arc::clone(&self.permits);
        let task_key = key.clone();

        debug!(key = %key, size = data.len(), "Scheduling processed result write");
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let size = data.len() as u64;
            let status = match cache.save(task_key.clone(), data).await {
                Ok(()) => {
                    sink.on_event(CacheEvent::WriteCompleted {
                        key: task_key,
                        size,
                    });
                    WriteStatus::Stored
                }
                Err(e) => {
                    let error = e.to_string();
                    sink.on_event(CacheEvent::WriteFailed {
                        key: task_key,
                        error: error.clone(),
                    });
                    WriteStatus::Failed(error)
                }
            };

            if !cancel.is_cancelled() {
                let _ = tx.send(status);
            }
        });

        ProcessOutcome::Scheduled(WriteReceipt { key, rx })
    }

    pub fn pending_writes(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every scheduled write to finish.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

impl Drop for ProcessedResultCacheProcessor {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ProcessedResultCacheProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessedResultCacheProcessor")
            .field("cache", &self.cache)
            .field("pending_writes", &self.tasks.len())
            .field("maintenance", &self.maintenance.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheBudget, CacheConfig};
    use crate::key::{OutputFormat, Resize, SourceIdentity, TransformOptions};
    use crate::request::{Artifact, RasterImage};
    use crate::store::CacheStore;
    use crate::test_utils::{RecordingSink, init_tracing};
    use bytes::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn setup(dir: &TempDir) -> (ProcessedResultCacheProcessor, Arc<RecordingSink>) {
        init_tracing();
        let sink = Arc::new(RecordingSink::default());
        let config = CacheConfig::builder()
            .with_cache_dir(dir.path())
            .with_budget(CacheBudget::new(1500, 100))
            .build();
        let cache = ProcessedImageCache::open_with_sink(config, sink.clone())
            .await
            .unwrap();
        (ProcessedResultCacheProcessor::new(Arc::new(cache)), sink)
    }

    fn request(name: &str) -> LoadRequest {
        LoadRequest::new(
            SourceIdentity::uri(name),
            TransformOptions::new().with_resize(Resize::new(64, 64)),
        )
    }

    fn decoded(len: usize) -> DecodeResult {
        DecodeResult::raster(RasterImage::new(
            Bytes::from(vec![7u8; len]),
            64,
            64,
            OutputFormat::Png,
        ))
        .with_processed(true)
    }

    async fn wait(outcome: ProcessOutcome) -> Option<WriteStatus> {
        match outcome {
            ProcessOutcome::Scheduled(receipt) => receipt.wait().await,
            ProcessOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_result_creates_no_entry() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;
        let req = request("banned");

        let outcome = processor.on_decode_complete(&req, &decoded(10).with_banned(true));
        assert!(matches!(
            outcome,
            ProcessOutcome::Rejected(RejectReason::BannedFromCache)
        ));

        let vector = DecodeResult::new(Artifact::Vector {
            data: Bytes::from_static(b"<svg/>"),
        });
        assert!(matches!(
            processor.on_decode_complete(&req, &vector),
            ProcessOutcome::Rejected(RejectReason::NotRaster)
        ));

        processor.drain().await;
        assert_eq!(processor.cache().store().unwrap().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_unprocessed_result_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;

        let outcome =
            processor.on_decode_complete(&request("plain"), &decoded(10).with_processed(false));

        assert!(matches!(
            outcome,
            ProcessOutcome::Rejected(RejectReason::NotProcessed)
        ));
        assert_eq!(processor.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_written_results_respect_budget() {
        let dir = TempDir::new().unwrap();
        let (processor, sink) = setup(&dir).await;

        let a = wait(processor.on_decode_complete(&request("A"), &decoded(1000))).await;
        assert_eq!(a, Some(WriteStatus::Stored));
        let b = wait(processor.on_decode_complete(&request("B"), &decoded(1000))).await;
        assert_eq!(b, Some(WriteStatus::Stored));

        let cache = processor.cache();
        assert!(cache.get(&request("A")).await.unwrap().is_none());
        assert_eq!(
            cache.get(&request("B")).await.unwrap(),
            Some(Bytes::from(vec![7u8; 1000]))
        );
        let evicted_a = cache.key_for(&request("A"));
        assert!(
            sink.events()
                .iter()
                .any(|e| matches!(e, CacheEvent::Evicted { key, .. } if *key == evicted_a))
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let (processor, sink) = setup(&dir).await;
        let req = request("C");
        let key = processor.cache().key_for(&req);
        std::fs::write(dir.path().join(key.shard()), b"blocker").unwrap();

        let status = wait(processor.on_decode_complete(&req, &decoded(10))).await;

        assert!(matches!(status, Some(WriteStatus::Failed(_))));
        assert!(!processor.cache().contains(&key));
        assert!(processor.cache().get(&req).await.unwrap().is_none());
        assert!(
            sink.events()
                .iter()
                .any(|e| matches!(e, CacheEvent::WriteFailed { key: k, .. } if *k == key))
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_gets_no_receipt() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;
        let req = request("cancelled");

        let outcome = processor.on_decode_complete(&req, &decoded(10));
        req.cancel();

        assert_eq!(wait(outcome).await, None);
        // The write itself is not abandoned.
        processor.drain().await;
        assert!(processor.cache().get(&req).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_caller_token_cancels_every_request() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;
        let token = CancellationToken::new();
        let first = request("first").with_cancellation(token.clone());
        let second = request("second").with_cancellation(token.clone());

        let a = processor.on_decode_complete(&first, &decoded(10));
        let b = processor.on_decode_complete(&second, &decoded(10));
        token.cancel();

        assert!(first.is_cancelled() && second.is_cancelled());
        assert_eq!(wait(a).await, None);
        assert_eq!(wait(b).await, None);
        processor.drain().await;
        assert_eq!(processor.cache().store().unwrap().entry_count(), 2);
    }

    #[tokio::test]
    async fn test_configured_maintenance_enforces_budget() {
        let dir = TempDir::new().unwrap();
        init_tracing();
        let config = CacheConfig::builder()
            .with_cache_dir(dir.path())
            .with_budget(CacheBudget::new(1500, 100))
            .with_maintenance_interval(Duration::from_millis(10))
            .build();
        let cache = Arc::new(ProcessedImageCache::open(config).await.unwrap());
        let processor = ProcessedResultCacheProcessor::new(Arc::clone(&cache));

        // Bypass the processor so only the periodic pass can evict.
        let store = cache.store().unwrap();
        let a = cache.key_for(&request("A"));
        let b = cache.key_for(&request("B"));
        store.put(a.clone(), Bytes::from(vec![1u8; 1000])).await.unwrap();
        store.put(b.clone(), Bytes::from(vec![2u8; 1000])).await.unwrap();

        for _ in 0..100 {
            if store.size_bytes() <= 1500 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.size_bytes(), 1000);
        assert!(!store.contains(&a));
        assert!(store.contains(&b));
        drop(processor);
    }

    #[tokio::test]
    async fn test_caller_does_not_wait_for_storage() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;
        let req = request("async");

        // Single threaded runtime: the write cannot start before we yield.
        let outcome = processor.on_decode_complete(&req, &decoded(10));
        let key = processor.cache().key_for(&req);
        assert!(outcome.is_scheduled());
        assert!(!processor.cache().contains(&key));
        assert_eq!(processor.pending_writes(), 1);

        processor.drain().await;
        assert!(processor.cache().contains(&key));
        assert_eq!(processor.pending_writes(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_identical_results_share_one_write() {
        let dir = TempDir::new().unwrap();
        let (processor, _) = setup(&dir).await;
        let req = request("dup");

        for _ in 0..8 {
            assert!(processor.on_decode_complete(&req, &decoded(32)).is_scheduled());
        }
        processor.drain().await;

        let stats = processor.cache().store().unwrap().stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(processor.cache().store().unwrap().entry_count(), 1);
    }
}
