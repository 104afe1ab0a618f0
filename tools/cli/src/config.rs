//! Command line configuration file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use wcpos_common::CollectionName;
use wcpos_remote::RestClientConfig;
use wcpos_replication::ReplicationConfig;

fn default_collections() -> Vec<String> {
    ["products", "customers", "taxes"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_save_interval_secs() -> u64 {
    60
}

/// Contents of the `--config` JSON file.
///
/// ```json
/// {
///   "store": {
///     "base_url": "https://shop.example.com/wp-json/wc/v3/",
///     "consumer_key": "ck_...",
///     "consumer_secret": "cs_..."
///   },
///   "collections": ["products", "taxes"],
///   "sync_interval_secs": 300
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    pub store: RestClientConfig,
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    /// Where collection snapshots live. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
    #[serde(default)]
    pub audit_interval_secs: Option<u64>,
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub batch_limit: Option<usize>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl CliConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse configuration JSON.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.collections.is_empty() {
            anyhow::bail!("At least one collection must be configured");
        }
        Ok(config)
    }

    /// Engine settings, starting from the engine defaults.
    pub fn replication(&self) -> ReplicationConfig {
        let mut config = ReplicationConfig::default();
        if let Some(secs) = self.sync_interval_secs {
            config = config.with_live_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(secs) = self.audit_interval_secs {
            config = config.with_audit_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(secs) = self.retry_delay_secs {
            config = config.with_retry_delay(Duration::from_secs(secs.max(1)));
        }
        if let Some(limit) = self.batch_limit {
            config = config.with_batch_limit(limit);
        }
        config
    }

    /// Configured collections, or `only` when given.
    pub fn collections(&self, only: &[String]) -> Result<Vec<CollectionName>> {
        let names = if only.is_empty() {
            &self.collections
        } else {
            only
        };
        names
            .iter()
            .map(|name| {
                CollectionName::new(name.as_str())
                    .with_context(|| format!("Invalid collection name '{}'", name))
            })
            .collect()
    }

    /// Snapshot directory: flag, then config file, then platform default.
    pub fn data_dir(&self, flag: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = flag.map(Path::to_path_buf).or_else(|| self.data_dir.clone()) {
            return Ok(dir);
        }
        dirs::data_dir()
            .map(|dir| dir.join("wcpos-sync"))
            .context("No data directory available; pass --data-dir")
    }
}

/// Snapshot file of one collection.
pub fn snapshot_path(data_dir: &Path, collection: &CollectionName) -> PathBuf {
    data_dir.join(format!("{}.json", collection))
}
