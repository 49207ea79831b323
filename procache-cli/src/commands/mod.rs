mod request;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use procache::{
    CacheKey, CacheStore, DecodeResult, OutputFormat, ProcessOutcome, ProcessedImageCache,
    ProcessedResultCacheProcessor, RasterImage, WriteStatus,
};
use tracing::{debug, info};

use crate::cli::{Command, RequestArgs};
use crate::error::AppError;
use crate::utils::format_bytes;

pub use self::request::build_request;

pub struct CommandExecutor {
    cache: Arc<ProcessedImageCache>,
}

impl CommandExecutor {
    pub fn new(cache: ProcessedImageCache) -> Self {
        Self {
            cache: Arc::new(cache),
        }
    }

    pub async fn execute(&self, command: Command) -> Result<(), AppError> {
        match command {
            Command::Stats => self.stats(),
            Command::List { limit } => self.list(limit),
            Command::Key { request } => self.key(&request),
            Command::Get { key, output } => self.get(&key, output.as_deref()).await,
            Command::Put { request, file } => self.put(&request, &file).await,
            Command::Remove { key } => self.remove(&key).await,
            Command::Evict => self.evict().await,
            Command::Clear => self.clear().await,
        }
    }

    fn stats(&self) -> Result<(), AppError> {
        let budget = self.cache.budget();
        let Some(store) = self.cache.store() else {
            println!("Cache disabled");
            return Ok(());
        };

        println!("Directory:   {}", store.root().display());
        println!(
            "Entries:     {} / {}",
            store.entry_count(),
            budget.max_entry_count
        );
        println!(
            "Size:        {} / {}",
            format_bytes(store.size_bytes()),
            format_bytes(budget.max_total_bytes)
        );
        println!("Eviction:    {:?}", self.cache.config().eviction_order);
        Ok(())
    }

    fn list(&self, limit: Option<usize>) -> Result<(), AppError> {
        let Some(store) = self.cache.store() else {
            return Ok(());
        };

        let mut entries: Vec<_> = store.iterate().collect();
        self.cache.config().eviction_order.sort(&mut entries);

        for entry in entries.iter().take(limit.unwrap_or(usize::MAX)) {
            let age = entry
                .last_access
                .elapsed()
                .map(|d| format!("{}s ago", d.as_secs()))
                .unwrap_or_else(|_| "just now".to_string());
            println!(
                "{}  {:>10}  {}",
                entry.key,
                format_bytes(entry.size_bytes),
                age
            );
        }
        debug!(total = entries.len(), "Listed cache entries");
        Ok(())
    }

    fn key(&self, args: &RequestArgs) -> Result<(), AppError> {
        let request = build_request(args)?;
        println!("{}", self.cache.key_for(&request));
        Ok(())
    }

    async fn get(&self, key: &str, output: Option<&Path>) -> Result<(), AppError> {
        let key = parse_key(key)?;
        let Some(data) = self.cache.get_by_key(&key).await? else {
            println!("Miss: {key}");
            return Ok(());
        };

        match output {
            Some(path) => {
                tokio::fs::write(path, &data).await?;
                info!(key = %key, path = %path.display(), size = data.len(), "Wrote cached payload");
            }
            None => println!("Hit: {key} ({})", format_bytes(data.len() as u64)),
        }
        Ok(())
    }

    async fn put(&self, args: &RequestArgs, file: &Path) -> Result<(), AppError> {
        let request = build_request(args)?;
        let data = Bytes::from(tokio::fs::read(file).await?);
        let format = file
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse().ok())
            .unwrap_or(OutputFormat::Original);

        let result =
            DecodeResult::raster(RasterImage::new(data, 0, 0, format)).with_processed(true);

        let processor = ProcessedResultCacheProcessor::new(Arc::clone(&self.cache));
        match processor.on_decode_complete(&request, &result) {
            ProcessOutcome::Rejected(reason) => {
                println!("Not cached: {reason}");
            }
            ProcessOutcome::Scheduled(receipt) => {
                let key = receipt.key().clone();
                match receipt.wait().await {
                    Some(WriteStatus::Stored) => println!("Stored: {key}"),
                    Some(WriteStatus::Failed(error)) => {
                        return Err(AppError::Storage(format!(
                            "failed to store {key}: {error}"
                        )));
                    }
                    None => println!("Cancelled: {key}"),
                }
            }
        }
        processor.drain().await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        let key = parse_key(key)?;
        if self.cache.remove(&key).await? {
            println!("Removed: {key}");
        } else {
            println!("Not found: {key}");
        }
        Ok(())
    }

    async fn evict(&self) -> Result<(), AppError> {
        let report = self.cache.enforce_budget().await;
        println!(
            "Evicted {} entries ({}), {} pending",
            report.evicted,
            format_bytes(report.freed_bytes),
            report.pending
        );
        report.into_result()?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), AppError> {
        self.cache.clear().await?;
        println!("Cache cleared");
        Ok(())
    }
}

fn parse_key(key: &str) -> Result<CacheKey, AppError> {
    CacheKey::parse(key).ok_or_else(|| AppError::InvalidInput(format!("invalid cache key '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use procache::CacheConfig;
    use tempfile::TempDir;

    use crate::cli::CliArgs;

    async fn executor(dir: &TempDir) -> CommandExecutor {
        let config = CacheConfig::builder()
            .with_cache_dir(dir.path().join("cache"))
            .build();
        CommandExecutor::new(ProcessedImageCache::open(config).await.unwrap())
    }

    fn command(args: &[&str]) -> Command {
        let mut argv = vec!["procache"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv).command
    }

    #[tokio::test]
    async fn test_put_then_remove() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let image = dir.path().join("thumb.png");
        std::fs::write(&image, b"png bytes").unwrap();

        let args = ["--source", "https://example.com/a.png", "--resize", "64x64"];
        let mut put = vec!["put"];
        put.extend_from_slice(&args);
        put.push(image.to_str().unwrap());
        executor.execute(command(&put)).await.unwrap();

        let Command::Put { request, .. } = command(&put) else {
            unreachable!()
        };
        let key = executor.cache.key_for(&build_request(&request).unwrap());
        assert_eq!(
            executor.cache.get_by_key(&key).await.unwrap(),
            Some(Bytes::from_static(b"png bytes"))
        );

        executor
            .execute(command(&["remove", key.as_str()]))
            .await
            .unwrap();
        assert!(!executor.cache.contains(&key));
    }

    #[tokio::test]
    async fn test_put_without_transform_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let image = dir.path().join("plain.png");
        std::fs::write(&image, b"png bytes").unwrap();

        executor
            .execute(command(&[
                "put",
                "--source",
                "https://example.com/a.png",
                image.to_str().unwrap(),
            ]))
            .await
            .unwrap();

        assert_eq!(executor.cache.store().unwrap().entry_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_put_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;
        let image = dir.path().join("thumb.png");
        std::fs::write(&image, b"png bytes").unwrap();

        let mut put = vec!["put", "--source", "https://example.com/b.png", "--resize", "64x64"];
        put.push(image.to_str().unwrap());
        let Command::Put { request, .. } = command(&put) else {
            unreachable!()
        };
        let key = executor.cache.key_for(&build_request(&request).unwrap());
        // A regular file where the shard directory should go.
        std::fs::write(dir.path().join("cache").join(key.shard()), b"blocker").unwrap();

        let err = executor.execute(command(&put)).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(!executor.cache.contains(&key));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir).await;

        let err = executor
            .execute(command(&["get", "not-a-key"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}
