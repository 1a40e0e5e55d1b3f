//! Serializable runtime configuration.
//!
//! Every section has defaults, so an empty TOML file (or no file at all) is a
//! valid configuration:
//!
//! ```toml
//! [engine]
//! batch_size_threshold = 5000
//! flush_interval_secs = 5
//! max_pool_connections = 100
//!
//! [metadata]
//! data_source = "akshare"
//!
//! [source]
//! endpoint = "http://127.0.0.1:8080/api/public"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub engine: EngineConfig,
    /// Extra fields written into every stored document.
    pub metadata: BTreeMap<String, String>,
    pub source: SourceConfig,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
}

/// Batch engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Pending row count that forces a flush.
    pub batch_size_threshold: usize,
    /// Maximum time pending rows wait before a flush.
    pub flush_interval_secs: f64,
    /// Connection pool size of the document store; batch concurrency is
    /// capped at half of it.
    pub max_pool_connections: usize,
    /// Concurrency used when neither the caller nor the collection sets one.
    pub default_concurrency: usize,
    /// Completed tasks between two progress reports, unless the collection
    /// sets its own.
    pub progress_interval: usize,
    /// Per-task failure messages kept in a run outcome.
    pub max_recorded_failures: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_threshold: 5000,
            flush_interval_secs: 5.0,
            max_pool_connections: 100,
            default_concurrency: 3,
            progress_interval: 50,
            max_recorded_failures: 20,
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs.max(0.0))
    }

    /// Concurrency actually used for a batch run: the request, capped at half
    /// the store's connection pool, never below one.
    pub fn effective_concurrency(&self, requested: usize) -> usize {
        let pool_cap = (self.max_pool_connections / 2).max(1);
        requested.clamp(1, pool_cap)
    }
}

/// HTTP source client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/api/public".into(),
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root holding one manifest directory per category plus `metadata.toml`.
    pub manifest_dir: PathBuf,
    pub categories: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest_dir: PathBuf::from("collections"),
            categories: ["stocks", "funds", "bonds", "futures", "options"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: SyncConfig = toml::from_str(content)?;
        if config.metadata.is_empty() {
            config.metadata = default_metadata();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.batch_size_threshold == 0 {
            return Err(ConfigError::Invalid(
                "engine.batch_size_threshold must be positive".into(),
            ));
        }
        if self.engine.default_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "engine.default_concurrency must be positive".into(),
            ));
        }
        if self.engine.progress_interval == 0 {
            return Err(ConfigError::Invalid(
                "engine.progress_interval must be positive".into(),
            ));
        }
        if !self.engine.flush_interval_secs.is_finite() || self.engine.flush_interval_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "engine.flush_interval_secs must be a positive number".into(),
            ));
        }
        Ok(())
    }

    /// Defaults with the standard `data_source` metadata filled in.
    pub fn standard() -> Self {
        Self {
            metadata: default_metadata(),
            ..Self::default()
        }
    }
}

fn default_metadata() -> BTreeMap<String, String> {
    BTreeMap::from([("data_source".to_string(), "akshare".to_string())])
}
