//! Configuration parsing for chatstore.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for library users via [`StorageConfig::default`]

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::batch::DEFAULT_CHUNK_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::pool::PoolConfig;
use crate::storage::stats::DEFAULT_RING_CAPACITY;

/// chatstore: a connection-pooled SQLite storage engine for chat data.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatstore")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path to the SQLite database file
    #[arg(short, long, env = "CHATSTORE_DB_PATH", default_value = "./data/chatstore.db")]
    pub db_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "CHATSTORE_LOG_JSON")]
    pub log_json: bool,

    /// Connections kept open at all times
    #[arg(long, env = "CHATSTORE_MIN_CONNECTIONS", default_value_t = 2)]
    pub min_connections: usize,

    /// Upper bound on open connections
    #[arg(long, env = "CHATSTORE_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: usize,

    /// Seconds a connection may sit idle before the reaper closes it
    #[arg(long, env = "CHATSTORE_MAX_IDLE_SECS", default_value_t = 300)]
    pub max_idle_secs: u64,

    /// Seconds between idle reaper sweeps
    #[arg(long, env = "CHATSTORE_CLEANUP_INTERVAL_SECS", default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    /// Seconds to wait for a free connection before failing
    #[arg(long, env = "CHATSTORE_ACQUIRE_TIMEOUT_SECS", default_value_t = 30)]
    pub acquire_timeout_secs: u64,

    /// Parameter tuples per batch chunk
    #[arg(long, env = "CHATSTORE_BATCH_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub batch_chunk_size: usize,

    /// Query stats kept in memory
    #[arg(long, env = "CHATSTORE_STATS_CAPACITY", default_value_t = DEFAULT_RING_CAPACITY)]
    pub stats_ring_capacity: usize,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show pool and query statistics
    Stats,
    /// Compact the database and refresh planner statistics
    Optimize,
    /// Remove archived sessions and stale performance rows
    Cleanup {
        /// Remove data older than this many days
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// Only count what would be removed
        #[arg(long)]
        dry_run: bool,
    },
    /// Search message content
    Search {
        /// Case-insensitive substring to look for
        term: String,
        /// Restrict to sessions owned by this user
        #[arg(long)]
        owner: Option<String>,
        /// Restrict to one session
        #[arg(long)]
        session: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Run retention cleanup and flush query stats periodically until stopped
    Maintain {
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
    },
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::from(self)
    }
}

/// Settings for [`StorageEngine`](crate::storage::StorageEngine).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub min_connections: usize,
    pub max_connections: usize,
    pub max_idle_time: Duration,
    pub cleanup_interval: Duration,
    pub acquire_timeout: Duration,
    pub batch_chunk_size: usize,
    pub stats_ring_capacity: usize,
}

impl StorageConfig {
    /// Defaults pointed at the given database file.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        self.pool_config().validate()?;
        if self.batch_chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "batch_chunk_size must be at least 1".into(),
            ));
        }
        if self.stats_ring_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "stats_ring_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            max_idle_time: self.max_idle_time,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            db_path: PathBuf::from("./data/chatstore.db"),
            min_connections: pool.min_connections,
            max_connections: pool.max_connections,
            max_idle_time: pool.max_idle_time,
            cleanup_interval: pool.cleanup_interval,
            acquire_timeout: Duration::from_secs(30),
            batch_chunk_size: DEFAULT_CHUNK_SIZE,
            stats_ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

impl From<&Config> for StorageConfig {
    fn from(config: &Config) -> Self {
        Self {
            db_path: config.db_path.clone(),
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            max_idle_time: Duration::from_secs(config.max_idle_secs),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            batch_chunk_size: config.batch_chunk_size,
            stats_ring_capacity: config.stats_ring_capacity,
        }
    }
}
