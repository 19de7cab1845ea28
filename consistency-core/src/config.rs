//! Configuration for the consistency core

use crate::types::EntityClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Store actor configuration
    pub store: StoreConfig,

    /// Identifier sequences
    pub identifiers: IdentifierConfig,

    /// Retry policy for transient store failures
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/consistency"),
            service_name: "consistency-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            store: StoreConfig::default(),
            identifiers: IdentifierConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Store actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bounded mailbox size (backpressure)
    pub mailbox_capacity: usize,

    /// How long a caller waits for a reply before giving up (milliseconds)
    pub request_timeout_ms: u64,

    /// fsync every commit
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            request_timeout_ms: 5_000,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Reply timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Identifier sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierConfig {
    /// First member number issued on a fresh store
    pub member_start_from: u64,

    /// First case number issued on a fresh store
    pub case_start_from: u64,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            member_start_from: 1,
            case_start_from: 1,
        }
    }
}

impl IdentifierConfig {
    /// Starting offset for a class
    pub fn start_from(&self, entity_class: EntityClass) -> u64 {
        match entity_class {
            EntityClass::Member => self.member_start_from,
            EntityClass::Case => self.case_start_from,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("CONSISTENCY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("CONSISTENCY_MEMBER_START_FROM") {
            config.identifiers.member_start_from = parse_env("CONSISTENCY_MEMBER_START_FROM", &value)?;
        }

        if let Ok(value) = std::env::var("CONSISTENCY_CASE_START_FROM") {
            config.identifiers.case_start_from = parse_env("CONSISTENCY_CASE_START_FROM", &value)?;
        }

        if let Ok(value) = std::env::var("CONSISTENCY_MAX_RETRIES") {
            config.retry.max_attempts = parse_env("CONSISTENCY_MAX_RETRIES", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.store.mailbox_capacity == 0 {
            return Err(crate::Error::Config("store.mailbox_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} is not a valid number: {:?}", name, value)))
}
