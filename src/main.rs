//! Chatstore: operator CLI for the chat storage engine.
//!
//! # Usage
//!
//! ```bash
//! chatstore --db-path ./data/chatstore.db stats
//! chatstore cleanup --days 30 --dry-run
//! chatstore --output json search "machine learning" --owner u1
//! chatstore maintain --interval-secs 3600 --retention-days 30
//! ```
//!
//! Environment variables can also be used:
//! - `CHATSTORE_DB_PATH`: SQLite database file
//! - `CHATSTORE_MAX_CONNECTIONS`: Pool upper bound
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Metrics collector
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use chatstore::config::{Command, Config, OutputFormat};
use chatstore::observability::metrics::init_metrics_with_endpoint;
use chatstore::observability::tracing::init_tracing;
use chatstore::storage::{
    CleanupReport, Message, OptimizeReport, PerformanceReport, QueryKind, StorageEngine,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Serialize)]
struct StatsOutput {
    sessions: i64,
    messages: i64,
    performance: PerformanceReport,
}

/// Print `value` as pretty JSON or through the text renderer.
fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T) -> String,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

fn count_rows(engine: &StorageEngine, table: &str) -> anyhow::Result<i64> {
    let result = engine.execute_query(
        &format!("SELECT COUNT(*) AS n FROM {table}"),
        &[],
        QueryKind::Select,
    )?;
    let n = result
        .rows
        .first()
        .map(|row| row.get::<i64>("n"))
        .transpose()?
        .unwrap_or_default();
    Ok(n)
}

fn render_stats(stats: &StatsOutput) -> String {
    let p = &stats.performance;
    let mut out = format!(
        "Sessions: {}\nMessages: {}\n\nPool: {} total, {} active, {} idle \
         ({} hits, {} misses, avg wait {:.2} ms, max wait {:.2} ms)\n\
         Queries: {} (avg {:.2} ms, min {:.2} ms, max {:.2} ms)",
        stats.sessions,
        stats.messages,
        p.pool.total,
        p.pool.active,
        p.pool.idle,
        p.pool.pool_hits,
        p.pool.pool_misses,
        p.pool.avg_wait_time_ms,
        p.pool.max_wait_time_ms,
        p.total_queries,
        p.avg_duration_ms,
        p.min_duration_ms,
        p.max_duration_ms,
    );
    for (kind, k) in &p.by_kind {
        out.push_str(&format!(
            "\n  {kind:<6} {:>6} queries  avg {:.2} ms  {} errors",
            k.count, k.avg_duration_ms, k.errors
        ));
    }
    out
}

fn render_cleanup(report: &CleanupReport) -> String {
    let verb = if report.dry_run { "Would remove" } else { "Removed" };
    format!(
        "{verb} {} sessions, {} messages, {} performance rows (cutoff {})",
        report.sessions, report.messages, report.performance_rows, report.cutoff
    )
}

fn render_optimize(report: &OptimizeReport) -> String {
    format!(
        "VACUUM {:.1} ms, ANALYZE {:.1} ms\n\
         Size: {} bytes ({} pages of {} bytes)\n\
         Free pages: {} -> {} (fragmentation {:.2}%)",
        report.vacuum_ms,
        report.analyze_ms,
        report.size_bytes,
        report.page_count,
        report.page_size,
        report.free_pages_before,
        report.free_pages_after,
        report.fragmentation_ratio * 100.0
    )
}

#[allow(clippy::ptr_arg)]
fn render_messages(messages: &Vec<Message>) -> String {
    if messages.is_empty() {
        return "No matching messages".to_string();
    }
    messages
        .iter()
        .map(|m| format!("[{}] {} {}: {}", m.timestamp, m.session_id, m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating shutdown...");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }
}

/// One flush-then-cleanup pass on the blocking pool.
async fn maintenance_pass(
    engine: Arc<StorageEngine>,
    retention_days: u32,
) -> anyhow::Result<(usize, CleanupReport)> {
    tokio::task::spawn_blocking(move || {
        let flushed = engine.flush_query_stats()?;
        let report = engine.cleanup_old_data(retention_days, false)?;
        Ok::<_, anyhow::Error>((flushed, report))
    })
    .await
    .context("maintenance task panicked")?
}

async fn run_maintain(
    engine: Arc<StorageEngine>,
    interval: Duration,
    retention_days: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match maintenance_pass(Arc::clone(&engine), retention_days).await {
                    Ok((flushed, report)) => tracing::info!(
                        flushed,
                        sessions = report.sessions,
                        messages = report.messages,
                        performance_rows = report.performance_rows,
                        "Maintenance pass complete"
                    ),
                    Err(e) => tracing::error!(error = %e, "Maintenance pass failed"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level, config.log_json);
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    let storage_config = config.storage_config();
    let engine = tokio::task::spawn_blocking(move || StorageEngine::open(storage_config))
        .await
        .context("storage open task panicked")?
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let engine = Arc::new(engine);
    let format = config.output;

    match config.command {
        Command::Stats => {
            engine.health_check()?;
            let stats = StatsOutput {
                sessions: count_rows(&engine, "chat_sessions")?,
                messages: count_rows(&engine, "chat_messages")?,
                performance: engine.performance_stats(),
            };
            emit(format, &stats, render_stats)?;
        }
        Command::Optimize => {
            let worker = Arc::clone(&engine);
            let report = tokio::task::spawn_blocking(move || worker.optimize_storage())
                .await
                .context("optimize task panicked")??;
            emit(format, &report, render_optimize)?;
        }
        Command::Cleanup { days, dry_run } => {
            let worker = Arc::clone(&engine);
            let report = tokio::task::spawn_blocking(move || worker.cleanup_old_data(days, dry_run))
                .await
                .context("cleanup task panicked")??;
            emit(format, &report, render_cleanup)?;
        }
        Command::Search {
            term,
            owner,
            session,
            limit,
        } => {
            let messages =
                engine.search_messages(&term, owner.as_deref(), session.as_deref(), limit)?;
            emit(format, &messages, render_messages)?;
        }
        Command::Maintain {
            interval_secs,
            retention_days,
        } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_signal().await;
                let _ = shutdown_tx.send(true);
            });

            tracing::info!(interval_secs, retention_days, "Maintenance loop started");
            let interval = Duration::from_secs(interval_secs.max(1));
            run_maintain(Arc::clone(&engine), interval, retention_days, shutdown_rx).await;

            if let Err(e) = engine.flush_query_stats() {
                tracing::warn!(error = %e, "Final stats flush failed");
            }
        }
    }

    engine.close();
    tracing::info!("Chatstore shutdown complete");
    Ok(())
}
