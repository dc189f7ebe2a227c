//! Retention cleanup, compaction and stats persistence.
//!
//! Cleanup, optimize and stats flushes hold the engine's maintenance lock for
//! their whole run so they never interleave. Cleanup and optimize fail with
//! [`StorageError::Maintenance`] naming the phase that broke and the counts
//! already committed by earlier phases.

use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::sync::atomic::Ordering;
use std::time::Instant;

use super::engine::StorageEngine;
use super::error::{StorageError, StorageResult};
use super::models::{CleanupReport, OptimizeReport};
use super::stats::QueryKind;
use crate::now_millis;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Archived sessions untouched since the cutoff.
const STALE_SESSIONS: &str = "FROM chat_sessions WHERE is_archived = 1 AND updated_at < ?1";

/// Messages of stale sessions plus any left without a session.
const STALE_MESSAGES: &str = "FROM chat_messages
    WHERE session_id IN (SELECT id FROM chat_sessions WHERE is_archived = 1 AND updated_at < ?1)
       OR session_id NOT IN (SELECT id FROM chat_sessions)";

const STALE_PERFORMANCE: &str = "FROM query_performance WHERE timestamp < ?1";

const INSERT_QUERY_STAT: &str = "INSERT INTO query_performance
    (query_type, query_hash, execution_time, rows_affected, timestamp, error_message)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

fn count(conn: &Connection, source: &str, cutoff: i64) -> rusqlite::Result<u64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) {source}"), params![cutoff], |row| {
        row.get(0)
    })?;
    Ok(n as u64)
}

fn delete(conn: &Connection, source: &str, cutoff: i64) -> rusqlite::Result<u64> {
    let n = conn.execute(&format!("DELETE {source}"), params![cutoff])?;
    Ok(n as u64)
}

fn pragma_i64(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, name, |row| row.get(0))
}

/// Read a size pragma during optimize, reporting the phases already done.
fn optimize_stat(
    conn: &Connection,
    name: &str,
    completed: &[(&'static str, u64)],
) -> StorageResult<i64> {
    pragma_i64(conn, name).map_err(maintenance_error("optimize", "stats", completed))
}

fn maintenance_error<'a>(
    operation: &'static str,
    phase: &'static str,
    completed: &'a [(&'static str, u64)],
) -> impl FnOnce(rusqlite::Error) -> StorageError + 'a {
    move |source| StorageError::Maintenance {
        operation,
        phase,
        completed: completed.to_vec(),
        source,
    }
}

impl StorageEngine {
    /// Remove archived sessions, their messages, orphaned messages and
    /// performance rows older than `older_than_days`.
    ///
    /// A dry run counts exactly the rows a live run would delete.
    pub fn cleanup_old_data(&self, older_than_days: u32, dry_run: bool) -> StorageResult<CleanupReport> {
        let cutoff = now_millis() - i64::from(older_than_days) * MILLIS_PER_DAY;
        self.cleanup_older_than(cutoff, dry_run)
    }

    /// [`cleanup_old_data`](Self::cleanup_old_data) with an explicit cutoff
    /// in unix epoch milliseconds.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn cleanup_older_than(&self, cutoff: i64, dry_run: bool) -> StorageResult<CleanupReport> {
        let _maintenance = self.maintenance_lock();
        let kind = if dry_run {
            QueryKind::Select
        } else {
            QueryKind::Delete
        };

        let report = self.instrumented(kind, "CLEANUP", |conn| {
            conn.with_connection(|c| {
                let report = if dry_run {
                    let tx = c.transaction()?;
                    let report = CleanupReport {
                        dry_run,
                        cutoff,
                        sessions: count(&tx, STALE_SESSIONS, cutoff)?,
                        messages: count(&tx, STALE_MESSAGES, cutoff)?,
                        performance_rows: count(&tx, STALE_PERFORMANCE, cutoff)?,
                    };
                    tx.commit()?;
                    report
                } else {
                    let mut completed = Vec::with_capacity(3);
                    let messages = delete(c, STALE_MESSAGES, cutoff)
                        .map_err(maintenance_error("cleanup", "messages", &completed))?;
                    completed.push(("messages", messages));
                    let sessions = delete(c, STALE_SESSIONS, cutoff)
                        .map_err(maintenance_error("cleanup", "sessions", &completed))?;
                    completed.push(("sessions", sessions));
                    let performance_rows = delete(c, STALE_PERFORMANCE, cutoff)
                        .map_err(maintenance_error("cleanup", "performance", &completed))?;
                    CleanupReport {
                        dry_run,
                        cutoff,
                        sessions,
                        messages,
                        performance_rows,
                    }
                };
                let total = report.sessions + report.messages + report.performance_rows;
                Ok((report, total as usize))
            })
        })?;

        tracing::info!(
            dry_run,
            cutoff,
            sessions = report.sessions,
            messages = report.messages,
            performance_rows = report.performance_rows,
            "Retention cleanup finished"
        );
        Ok(report)
    }

    /// Compact the database and refresh planner statistics.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn optimize_storage(&self) -> StorageResult<OptimizeReport> {
        let _maintenance = self.maintenance_lock();

        let report = self.instrumented(QueryKind::Update, "OPTIMIZE", |conn| {
            conn.with_connection(|c| {
                let free_pages_before = optimize_stat(c, "freelist_count", &[])?;

                let started = Instant::now();
                c.execute_batch("VACUUM")
                    .map_err(maintenance_error("optimize", "vacuum", &[]))?;
                let vacuum_ms = started.elapsed().as_secs_f64() * 1000.0;

                let started = Instant::now();
                c.execute_batch("ANALYZE")
                    .map_err(maintenance_error("optimize", "analyze", &[]))?;
                let analyze_ms = started.elapsed().as_secs_f64() * 1000.0;

                // Fold the WAL back so the page count reflects the main file.
                if let Err(e) =
                    c.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get::<_, i64>(0))
                {
                    tracing::debug!(error = %e, "WAL checkpoint skipped");
                }

                let completed = [
                    ("vacuum_ms", vacuum_ms as u64),
                    ("analyze_ms", analyze_ms as u64),
                ];
                let page_size = optimize_stat(c, "page_size", &completed)?;
                let page_count = optimize_stat(c, "page_count", &completed)?;
                let free_pages_after = optimize_stat(c, "freelist_count", &completed)?;
                let fragmentation_ratio = if page_count > 0 {
                    free_pages_after as f64 / page_count as f64
                } else {
                    0.0
                };

                Ok((
                    OptimizeReport {
                        vacuum_ms,
                        analyze_ms,
                        page_size,
                        page_count,
                        size_bytes: page_size * page_count,
                        free_pages_before,
                        free_pages_after,
                        fragmentation_ratio,
                    },
                    0,
                ))
            })
        })?;

        tracing::info!(
            vacuum_ms = report.vacuum_ms,
            analyze_ms = report.analyze_ms,
            size_bytes = report.size_bytes,
            free_pages_before = report.free_pages_before,
            free_pages_after = report.free_pages_after,
            "Storage optimized"
        );
        Ok(report)
    }

    /// Persist stats recorded since the last flush into `query_performance`.
    ///
    /// Returns the number of rows written.
    pub fn flush_query_stats(&self) -> StorageResult<usize> {
        let _maintenance = self.maintenance_lock();
        let from = self.flushed_seq().load(Ordering::Acquire);
        let (pending, next) = self.stats_ring().since(from);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut batch = self.new_batch(QueryKind::Insert, "query_performance");
        for stat in &pending {
            batch.add(
                INSERT_QUERY_STAT,
                vec![
                    Value::Text(stat.kind.as_str().to_string()),
                    Value::Text(stat.fingerprint.clone()),
                    Value::Real(stat.duration.as_secs_f64()),
                    Value::Integer(i64::try_from(stat.rows_affected).unwrap_or(i64::MAX)),
                    Value::Integer(stat.timestamp),
                    stat.error.clone().map_or(Value::Null, Value::Text),
                ],
            );
        }
        let written = self.execute_batch(batch)?;
        self.flushed_seq().fetch_max(next, Ordering::AcqRel);
        tracing::debug!(rows = written, "query stats flushed");
        Ok(written)
    }
}
