//! Configuration module for Kura
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Durations are plain integer
//! seconds (`*_seconds`) and exposed as [`Duration`] through accessors.
//!
//! # Example
//!
//! ```yaml
//! server:
//!   address: "0.0.0.0:3200"
//! storage:
//!   backend: s3
//!   s3:
//!     bucket: traces
//!     region: us-east-1
//!     endpoint: "${S3_ENDPOINT:-http://localhost:9000}"
//!     force_path_style: true
//!   wal:
//!     path: /var/kura/wal
//! compactor:
//!   block_retention_seconds: 1209600
//! ```

use crate::encoding::Encoding;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingester: IngesterConfig,
    #[serde(default)]
    pub compactor: CompactorConfig,
    #[serde(default)]
    pub querier: QuerierConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend {
            BackendKind::Local => {
                if self.storage.local.path.trim().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "storage.local.path cannot be empty with the local backend".into(),
                    ));
                }
            }
            BackendKind::S3 => match &self.storage.s3 {
                None => {
                    return Err(ConfigError::ValidationError(
                        "storage.s3 must be set with the s3 backend".into(),
                    ))
                }
                Some(s3) => {
                    if s3.bucket.trim().is_empty() || s3.region.trim().is_empty() {
                        return Err(ConfigError::ValidationError(
                            "storage.s3 requires bucket and region".into(),
                        ));
                    }
                    if let Some(endpoint) = &s3.endpoint {
                        if !is_valid_http_url(endpoint) {
                            return Err(ConfigError::ValidationError(format!(
                                "Invalid S3 endpoint '{}': must start with http:// or https://",
                                endpoint
                            )));
                        }
                    }
                }
            },
            BackendKind::Memory => {}
        }

        if self.storage.wal.path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.wal.path cannot be empty".into(),
            ));
        }

        let fp = self.storage.block.bloom_fp;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid bloom_fp {}: must be between 0.0 and 1.0 exclusive",
                fp
            )));
        }

        if self.storage.block.index_downsample_bytes == 0
            || self.storage.block.bloom_shard_size_bytes == 0
        {
            return Err(ConfigError::ValidationError(
                "index_downsample_bytes and bloom_shard_size_bytes must be positive".into(),
            ));
        }

        if self.storage.pool.max_workers == 0 {
            return Err(ConfigError::ValidationError(
                "storage.pool.max_workers must be at least 1".into(),
            ));
        }

        if self.ingester.concurrent_flushes == 0 {
            return Err(ConfigError::ValidationError(
                "ingester.concurrent_flushes must be at least 1".into(),
            ));
        }

        if self.compactor.input_blocks < 2 {
            return Err(ConfigError::ValidationError(
                "compactor.input_blocks must be at least 2".into(),
            ));
        }

        if self.compactor.output_blocks == 0 {
            return Err(ConfigError::ValidationError(
                "compactor.output_blocks must be at least 1".into(),
            ));
        }

        for endpoint in &self.querier.federation {
            if !is_valid_http_url(endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid federation endpoint '{}': must start with http:// or https://",
                    endpoint
                )));
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging format '{}': must be 'text' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:3200".to_string()
}

/// Backend object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    S3,
    Memory,
}

/// Block storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub local: LocalStorageConfig,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_blocklist_poll")]
    pub blocklist_poll_seconds: u64,
}

impl StorageConfig {
    pub fn blocklist_poll(&self) -> Duration {
        Duration::from_secs(self.blocklist_poll_seconds)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            local: LocalStorageConfig::default(),
            s3: None,
            wal: WalConfig::default(),
            block: BlockConfig::default(),
            pool: PoolConfig::default(),
            blocklist_poll_seconds: default_blocklist_poll(),
        }
    }
}

fn default_blocklist_poll() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_path")]
    pub path: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: default_local_path(),
        }
    }
}

fn default_local_path() -> String {
    "/var/kura/blocks".to_string()
}

/// S3 backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    #[serde(default = "default_wal_path")]
    pub path: String,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: default_wal_path(),
        }
    }
}

fn default_wal_path() -> String {
    "/var/kura/wal".to_string()
}

/// Backend block encoding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default = "default_block_encoding")]
    pub encoding: Encoding,
    #[serde(default = "default_index_downsample_bytes")]
    pub index_downsample_bytes: usize,
    #[serde(default = "default_bloom_fp")]
    pub bloom_fp: f64,
    #[serde(default = "default_bloom_shard_size_bytes")]
    pub bloom_shard_size_bytes: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            encoding: default_block_encoding(),
            index_downsample_bytes: default_index_downsample_bytes(),
            bloom_fp: default_bloom_fp(),
            bloom_shard_size_bytes: default_bloom_shard_size_bytes(),
        }
    }
}

fn default_block_encoding() -> Encoding {
    Encoding::Zstd
}

fn default_index_downsample_bytes() -> usize {
    1048576 // 1MB
}

fn default_bloom_fp() -> f64 {
    0.01
}

fn default_bloom_shard_size_bytes() -> usize {
    102400 // 100KB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_workers() -> usize {
    50
}

/// Ingester configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    #[serde(default = "default_max_block_bytes")]
    pub max_block_bytes: u64,
    #[serde(default = "default_max_block_duration")]
    pub max_block_duration_seconds: u64,
    #[serde(default = "default_flush_check_period")]
    pub flush_check_period_seconds: u64,
    #[serde(default = "default_max_bytes_per_trace")]
    pub max_bytes_per_trace: usize,
    #[serde(default = "default_concurrent_flushes")]
    pub concurrent_flushes: usize,
    /// How long a flushed block stays queryable in the ingester
    #[serde(default = "default_complete_block_timeout")]
    pub complete_block_timeout_seconds: u64,
    /// Upper bound on writing one block to the backend
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_seconds: u64,
}

impl IngesterConfig {
    pub fn max_block_duration(&self) -> Duration {
        Duration::from_secs(self.max_block_duration_seconds)
    }

    pub fn flush_check_period(&self) -> Duration {
        Duration::from_secs(self.flush_check_period_seconds.max(1))
    }

    pub fn complete_block_timeout(&self) -> Duration {
        Duration::from_secs(self.complete_block_timeout_seconds)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_seconds.max(1))
    }
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            max_block_bytes: default_max_block_bytes(),
            max_block_duration_seconds: default_max_block_duration(),
            flush_check_period_seconds: default_flush_check_period(),
            max_bytes_per_trace: default_max_bytes_per_trace(),
            concurrent_flushes: default_concurrent_flushes(),
            complete_block_timeout_seconds: default_complete_block_timeout(),
            flush_timeout_seconds: default_flush_timeout(),
        }
    }
}

fn default_max_block_bytes() -> u64 {
    524288000 // 500MB
}

fn default_max_block_duration() -> u64 {
    1800
}

fn default_flush_check_period() -> u64 {
    10
}

fn default_max_bytes_per_trace() -> usize {
    5000000
}

fn default_concurrent_flushes() -> usize {
    4
}

fn default_complete_block_timeout() -> u64 {
    900
}

fn default_flush_timeout() -> u64 {
    300
}

/// Compactor and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactorConfig {
    #[serde(default = "default_compactor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_maintenance_cycle")]
    pub maintenance_cycle_seconds: u64,
    #[serde(default = "default_input_blocks")]
    pub input_blocks: usize,
    #[serde(default = "default_output_blocks")]
    pub output_blocks: usize,
    #[serde(default = "default_max_compaction_range")]
    pub max_compaction_range_seconds: u64,
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u32,
    #[serde(default = "default_block_retention")]
    pub block_retention_seconds: u64,
    #[serde(default = "default_compacted_block_retention")]
    pub compacted_block_retention_seconds: u64,
}

impl CompactorConfig {
    pub fn maintenance_cycle(&self) -> Duration {
        Duration::from_secs(self.maintenance_cycle_seconds.max(1))
    }

    pub fn max_compaction_range(&self) -> Duration {
        Duration::from_secs(self.max_compaction_range_seconds)
    }

    pub fn block_retention(&self) -> Duration {
        Duration::from_secs(self.block_retention_seconds)
    }

    pub fn compacted_block_retention(&self) -> Duration {
        Duration::from_secs(self.compacted_block_retention_seconds)
    }
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            enabled: default_compactor_enabled(),
            maintenance_cycle_seconds: default_maintenance_cycle(),
            input_blocks: default_input_blocks(),
            output_blocks: default_output_blocks(),
            max_compaction_range_seconds: default_max_compaction_range(),
            chunk_size_bytes: default_chunk_size_bytes(),
            block_retention_seconds: default_block_retention(),
            compacted_block_retention_seconds: default_compacted_block_retention(),
        }
    }
}

fn default_compactor_enabled() -> bool {
    true
}

fn default_maintenance_cycle() -> u64 {
    30
}

fn default_input_blocks() -> usize {
    4
}

fn default_output_blocks() -> usize {
    2
}

fn default_max_compaction_range() -> u64 {
    3600
}

fn default_chunk_size_bytes() -> u32 {
    10485760 // 10MB
}

fn default_block_retention() -> u64 {
    1209600 // 14 days
}

fn default_compacted_block_retention() -> u64 {
    3600
}

/// Querier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerierConfig {
    /// Peer instances queried alongside the local store
    #[serde(default)]
    pub federation: Vec<String>,
    #[serde(default = "default_federation_timeout")]
    pub federation_timeout_seconds: u64,
}

impl QuerierConfig {
    pub fn federation_timeout(&self) -> Duration {
        Duration::from_secs(self.federation_timeout_seconds)
    }
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            federation: Vec::new(),
            federation_timeout_seconds: default_federation_timeout(),
        }
    }
}

fn default_federation_timeout() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Token rate for rate-limited log sites
    #[serde(default = "default_rate_limited_per_second")]
    pub rate_limited_per_second: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            rate_limited_per_second: default_rate_limited_per_second(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_rate_limited_per_second() -> u32 {
    10
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
