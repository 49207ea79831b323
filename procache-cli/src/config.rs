use std::path::{Path, PathBuf};
use std::time::Duration;

use procache::{CacheConfig, EvictionOrder};
use serde::{Deserialize, Serialize};

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::parse_size;

/// Settings read from the optional TOML configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: Option<bool>,

    /// Cache directory
    pub dir: Option<PathBuf>,

    /// Maximum total size with optional unit, e.g. "100MB"
    pub max_size: Option<String>,

    pub max_entries: Option<usize>,

    pub eviction_order: Option<EvictionOrder>,

    /// Maximum number of concurrent background writes
    pub write_concurrency: Option<usize>,

    /// Seconds between background budget passes while writes are running
    pub maintenance_interval_secs: Option<u64>,
}

impl FileConfig {
    /// Load the file at `path`; no path means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, AppError> {
        toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Merge with command line flags, which take precedence.
    pub fn into_cache_config(self, args: &CliArgs) -> Result<CacheConfig, AppError> {
        let mut builder = CacheConfig::builder();

        if let Some(enabled) = self.enabled {
            builder = builder.with_enabled(enabled);
        }
        if let Some(dir) = args.dir.as_ref().or(self.dir.as_ref()) {
            builder = builder.with_cache_dir(dir);
        }
        if let Some(size) = args.max_size.as_deref().or(self.max_size.as_deref()) {
            builder = builder.with_max_total_bytes(parse_size(size)?);
        }
        if let Some(count) = args.max_entries.or(self.max_entries) {
            builder = builder.with_max_entry_count(count);
        }
        if let Some(order) = self.eviction_order {
            builder = builder.with_eviction_order(order);
        }
        if let Some(concurrency) = self.write_concurrency {
            builder = builder.with_write_concurrency(concurrency);
        }
        if let Some(secs) = self.maintenance_interval_secs {
            builder = builder.with_maintenance_interval(Duration::from_secs(secs));
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            dir = "/var/cache/procache"
            max_size = "10MB"
            max_entries = 50
            eviction_order = "insertion_order"
            maintenance_interval_secs = 300
            "#,
        )
        .unwrap();
        let args = CliArgs::parse_from(["procache", "--max-size", "2KB", "stats"]);

        let config = file.into_cache_config(&args).unwrap();

        assert_eq!(config.budget.max_total_bytes, 2048);
        assert_eq!(config.budget.max_entry_count, 50);
        assert_eq!(config.eviction_order, EvictionOrder::InsertionOrder);
        assert_eq!(config.maintenance_interval, Some(Duration::from_secs(300)));
        assert_eq!(
            config.resolved_cache_dir(),
            PathBuf::from("/var/cache/procache")
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(FileConfig::parse("max_entries = \"many\"").is_err());

        let args = CliArgs::parse_from(["procache", "--max-entries", "0", "stats"]);
        assert!(FileConfig::default().into_cache_config(&args).is_err());

        let zero_interval = FileConfig::parse("maintenance_interval_secs = 0").unwrap();
        let args = CliArgs::parse_from(["procache", "stats"]);
        assert!(zero_interval.into_cache_config(&args).is_err());
    }
}
