//! Storage engine facade.
//!
//! [`StorageEngine`] owns the connection pool, bootstraps the schema and
//! records a [`QueryStat`] for every operation it runs. Higher-level session,
//! message and maintenance operations live in sibling modules as further
//! `impl StorageEngine` blocks.

use rusqlite::types::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::batch::BatchOperation;
use super::connection::{PooledConnection, Row};
use super::error::StorageResult;
use super::pool::ConnectionPool;
use super::schema::initialize_schema;
use super::stats::{statement_fingerprint, PerformanceReport, QueryKind, QueryStat, StatsRing};
use crate::config::StorageConfig;
use crate::now_millis;

/// Rows and change count from [`StorageEngine::execute_query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows_affected: usize,
    pub rows: Vec<Row>,
}

/// Pooled, instrumented storage engine.
///
/// Owned by the application's composition root and shared by reference
/// (typically behind an `Arc`).
pub struct StorageEngine {
    db_path: PathBuf,
    pool: ConnectionPool,
    stats: StatsRing,
    acquire_timeout: Duration,
    batch_chunk_size: usize,
    /// Serializes cleanup and optimize passes.
    maintenance: Mutex<()>,
    /// First stats-ring sequence not yet mirrored to `query_performance`.
    flushed_seq: AtomicU64,
}

impl StorageEngine {
    /// Open (creating if needed) the database and start the pool.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = ConnectionPool::new(&config.db_path, config.pool_config())?;
        {
            let conn = pool.acquire(config.acquire_timeout)?;
            conn.with_connection(|c| Ok(initialize_schema(c)?))?;
        }

        tracing::info!(
            path = %config.db_path.display(),
            chunk_size = config.batch_chunk_size,
            stats_capacity = config.stats_ring_capacity,
            "Storage engine opened"
        );

        Ok(Self {
            db_path: config.db_path,
            pool,
            stats: StatsRing::new(config.stats_ring_capacity),
            acquire_timeout: config.acquire_timeout,
            batch_chunk_size: config.batch_chunk_size,
            maintenance: Mutex::new(()),
            flushed_seq: AtomicU64::new(0),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Start a batch that uses the configured chunk size.
    pub fn new_batch(&self, kind: QueryKind, table: impl Into<String>) -> BatchOperation {
        BatchOperation::new(kind, table).with_chunk_size(self.batch_chunk_size)
    }

    /// Run one statement on a pooled connection.
    #[tracing::instrument(level = "debug", skip(self, params))]
    pub fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        kind: QueryKind,
    ) -> StorageResult<QueryResult> {
        self.instrumented(kind, sql, |conn| {
            let (rows_affected, rows) = conn.execute(sql, params)?;
            Ok((QueryResult { rows_affected, rows }, rows_affected))
        })
    }

    /// Execute a batch, recording it as one `BATCH` stat.
    #[tracing::instrument(level = "debug", skip(self, batch), fields(table = %batch.table(), entries = batch.len()))]
    pub fn execute_batch(&self, batch: BatchOperation) -> StorageResult<usize> {
        let fingerprint = statement_fingerprint(&format!("BATCH {}", batch.table()));
        let started = Instant::now();
        let result = batch.execute(&self.pool, self.acquire_timeout);
        self.record(
            QueryKind::Batch,
            fingerprint,
            started,
            result.as_ref().ok().copied().unwrap_or(0),
            result.as_ref().err().map(ToString::to_string),
        );
        result
    }

    /// Aggregate the stats ring with a pool snapshot.
    pub fn performance_stats(&self) -> PerformanceReport {
        self.stats.report(self.pool.stats())
    }

    /// Recorded stats, oldest first.
    pub fn query_stats(&self) -> Vec<QueryStat> {
        self.stats.snapshot()
    }

    /// Acquire a connection and run `SELECT 1`.
    pub fn health_check(&self) -> StorageResult<()> {
        self.execute_query("SELECT 1", &[], QueryKind::Select)?;
        tracing::debug!("Storage health check passed");
        Ok(())
    }

    /// Shut the pool down. Further operations fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.shutdown();
        tracing::info!(path = %self.db_path.display(), "Storage engine closed");
    }

    /// Borrow a connection, run `f`, and record the outcome.
    ///
    /// `f` returns its value together with the row count to record.
    pub(crate) fn instrumented<T, F>(&self, kind: QueryKind, sql: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce(&PooledConnection) -> StorageResult<(T, usize)>,
    {
        let started = Instant::now();
        let result = self
            .pool
            .acquire(self.acquire_timeout)
            .and_then(|conn| f(&conn));

        let (rows, error) = match &result {
            Ok((_, rows)) => (*rows, None),
            Err(e) => (0, Some(e.to_string())),
        };
        self.record(kind, statement_fingerprint(sql), started, rows, error);
        result.map(|(value, _)| value)
    }

    pub(crate) fn maintenance_lock(&self) -> MutexGuard<'_, ()> {
        self.maintenance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stats_ring(&self) -> &StatsRing {
        &self.stats
    }

    pub(crate) fn flushed_seq(&self) -> &AtomicU64 {
        &self.flushed_seq
    }

    fn record(
        &self,
        kind: QueryKind,
        fingerprint: String,
        started: Instant,
        rows_affected: usize,
        error: Option<String>,
    ) {
        let duration = started.elapsed();
        if let Some(error) = &error {
            tracing::debug!(kind = %kind, fingerprint = %fingerprint, error = %error, "query failed");
        }
        self.stats.record(QueryStat {
            kind,
            duration,
            rows_affected,
            timestamp: now_millis(),
            fingerprint,
            error,
        });
    }
}
