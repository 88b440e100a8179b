//! Storage engine configuration.
//!
//! Settings are grouped by concern, with every group falling back to its
//! defaults when omitted from the JSON file:
//!
//! - **Connection**: pool sizing, idle/age limits, acquisition timeout
//! - **Performance**: SQLite pragmas and periodic checkpointing
//! - **Cache**: entry/memory caps and TTL for the task cache
//! - **Health**: thresholds used to mark a connection unhealthy
//! - **Retry**: backoff parameters for transient failures
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskvault::libs::config::StorageConfig;
//!
//! // Missing file -> defaults
//! let config = StorageConfig::read("taskvault.json")?;
//! println!("database: {}", config.database_path().display());
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hard ceiling on pooled connections regardless of configuration.
///
/// SQLite serializes writers, so connections beyond this only add
/// `SQLITE_BUSY` contention.
pub const MAX_POOL_CONNECTIONS: usize = 5;

pub const DEFAULT_DB_NAME: &str = "taskvault";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database file and its `-wal`/`-shm` companions.
    pub base_dir: PathBuf,
    /// Database file stem; the file is `<base_dir>/<name>.db`.
    pub name: String,
    pub connection: ConnectionConfig,
    pub performance: PerformanceConfig,
    pub cache: CacheConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Requested pool size, clamped to [`MAX_POOL_CONNECTIONS`].
    pub max_connections: usize,
    /// Idle cleanup never shrinks the pool below this.
    pub min_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub max_connection_age_ms: u64,
    pub cleanup_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Negative values are KiB, as with `PRAGMA cache_size`.
    pub cache_size: i64,
    pub page_size: u32,
    pub mmap_size: u64,
    /// `0` disables the periodic checkpoint timer.
    pub checkpoint_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub ttl_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub max_errors: u32,
    pub max_response_time_ms: u64,
    pub check_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub wal_base_delay_ms: u64,
    pub wal_max_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            base_dir: PathBuf::from("."),
            name: DEFAULT_DB_NAME.to_string(),
            connection: ConnectionConfig::default(),
            performance: PerformanceConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_connections: MAX_POOL_CONNECTIONS,
            min_connections: 1,
            idle_timeout_ms: 60_000,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            max_connection_age_ms: 30 * 60 * 1000,
            cleanup_interval_ms: 30_000,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            cache_size: -8_000,
            page_size: 4096,
            mmap_size: 64 * 1024 * 1024,
            checkpoint_interval_ms: 0,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 1_000,
            max_memory_bytes: 50 * 1024 * 1024,
            ttl_ms: 60_000,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            max_errors: 5,
            max_response_time_ms: 1_000,
            check_interval_ms: 30_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            wal_base_delay_ms: 250,
            wal_max_delay_ms: 5_000,
        }
    }
}

impl StorageConfig {
    /// Config rooted at `base_dir` with every other setting at its default.
    pub fn in_dir(base_dir: impl Into<PathBuf>) -> Self {
        StorageConfig {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Reads configuration from a JSON file.
    ///
    /// A missing file is not an error: the defaults are returned so the
    /// engine can start with no setup. A file that exists but does not parse
    /// is reported with its path.
    pub fn read(path: impl AsRef<Path>) -> Result<StorageConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(StorageConfig::default());
        }

        let raw = fs::read_to_string(path).with_context(|| format!("failed to read config {}", path.display()))?;
        let config: StorageConfig =
            serde_json::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.db", self.name))
    }
}

impl ConnectionConfig {
    /// Pool size actually used: at least one, at most [`MAX_POOL_CONNECTIONS`].
    pub fn effective_max(&self) -> usize {
        self.max_connections.clamp(1, MAX_POOL_CONNECTIONS)
    }

    pub fn effective_min(&self) -> usize {
        self.min_connections.min(self.effective_max())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_millis(self.max_connection_age_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}
