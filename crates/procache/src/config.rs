//! # Cache Configuration
//!
//! Configuration is passed explicitly into the cache at construction and is
//! immutable afterwards.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use procache::{CacheBudget, CacheConfig, EvictionOrder};
//!
//! let config = CacheConfig::builder()
//!     .with_cache_dir("/tmp/procache-doc")
//!     .with_budget(CacheBudget::new(64 * 1024 * 1024, 1_000))
//!     .with_eviction_order(EvictionOrder::LeastRecentlyUsed)
//!     .with_maintenance_interval(Duration::from_secs(300))
//!     .build();
//!
//! assert_eq!(config.budget.max_entry_count, 1_000);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::key::TransformOptions;

/// Capacity limits for the whole cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBudget {
    pub max_total_bytes: u64,
    pub max_entry_count: usize,
}

impl CacheBudget {
    pub fn new(max_total_bytes: u64, max_entry_count: usize) -> Self {
        Self {
            max_total_bytes,
            max_entry_count,
        }
    }

    pub fn is_exceeded_by(&self, total_bytes: u64, entry_count: usize) -> bool {
        total_bytes > self.max_total_bytes || entry_count > self.max_entry_count
    }
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_total_bytes: 100 * 1024 * 1024, // 100MB
            max_entry_count: 10_000,
        }
    }
}

/// Order in which entries are chosen for eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionOrder {
    /// Oldest last access first, ties broken by insertion order
    #[default]
    LeastRecentlyUsed,
    /// Oldest insertion first, ignoring reads
    InsertionOrder,
}

/// Decides whether the processed cache may be used for a set of options.
pub trait UsagePolicy: Send + Sync {
    fn can_use(&self, options: &TransformOptions) -> bool;
}

impl<F> UsagePolicy for F
where
    F: Fn(&TransformOptions) -> bool + Send + Sync,
{
    fn can_use(&self, options: &TransformOptions) -> bool {
        self(options)
    }
}

/// Usable when the request opts into disk caching of processed results and
/// actually asks for a pixel transform. Untransformed loads are already
/// served by the source cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUsagePolicy;

impl UsagePolicy for DefaultUsagePolicy {
    fn can_use(&self, options: &TransformOptions) -> bool {
        options.cache_processed_in_disk && options.has_pixel_transform()
    }
}

/// Configuration for the processed result cache
#[derive(Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Directory for cache entries; the system temp dir is used if unset
    pub cache_dir: Option<PathBuf>,
    pub budget: CacheBudget,
    pub eviction_order: EvictionOrder,
    /// Maximum number of concurrent background writes
    pub write_concurrency: usize,
    /// Period of the background budget enforcement task, if any
    pub maintenance_interval: Option<Duration>,
    pub usage: Arc<dyn UsagePolicy>,
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("enabled", &self.enabled)
            .field("cache_dir", &self.cache_dir)
            .field("budget", &self.budget)
            .field("eviction_order", &self.eviction_order)
            .field("write_concurrency", &self.write_concurrency)
            .field("maintenance_interval", &self.maintenance_interval)
            .finish_non_exhaustive()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: None,
            budget: CacheBudget::default(),
            eviction_order: EvictionOrder::default(),
            write_concurrency: 4,
            maintenance_interval: None,
            usage: Arc::new(DefaultUsagePolicy),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    /// Cache directory, falling back to `<temp>/procache`.
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("procache"))
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.budget.max_total_bytes == 0 {
            return Err(CacheError::Config(
                "max_total_bytes must be greater than zero".to_string(),
            ));
        }
        if self.budget.max_entry_count == 0 {
            return Err(CacheError::Config(
                "max_entry_count must be greater than zero".to_string(),
            ));
        }
        if self.write_concurrency == 0 {
            return Err(CacheError::Config(
                "write_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.maintenance_interval.is_some_and(|d| d.is_zero()) {
            return Err(CacheError::Config(
                "maintenance_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_budget(mut self, budget: CacheBudget) -> Self {
        self.config.budget = budget;
        self
    }

    pub fn with_max_total_bytes(mut self, bytes: u64) -> Self {
        self.config.budget.max_total_bytes = bytes;
        self
    }

    pub fn with_max_entry_count(mut self, count: usize) -> Self {
        self.config.budget.max_entry_count = count;
        self
    }

    pub fn with_eviction_order(mut self, order: EvictionOrder) -> Self {
        self.config.eviction_order = order;
        self
    }

    pub fn with_write_concurrency(mut self, concurrency: usize) -> Self {
        self.config.write_concurrency = concurrency;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.config.maintenance_interval = Some(interval);
        self
    }

    pub fn with_usage_policy(mut self, usage: impl UsagePolicy + 'static) -> Self {
        self.config.usage = Arc::new(usage);
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
