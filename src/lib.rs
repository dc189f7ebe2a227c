//! Chatstore: a connection-pooled SQLite storage engine for chat data.
//!
//! Chatstore persists chat sessions and messages behind a bounded pool of
//! SQLite connections, with chunked batch writes, paginated and searched
//! reads, retention cleanup and per-query performance statistics.
//!
//! # Architecture
//!
//! - **Bounded pool**: `min..=max` connections, blocking acquire
//!   with a timeout, idle connections reaped on a background thread
//! - **WAL mode**: readers proceed while small transactional writes commit
//! - **Instrumented**: every engine operation records a query stat into an
//!   in-memory ring, mirrored to OpenTelemetry metrics
//!
//! # Modules
//!
//! - [`config`]: CLI, environment and library configuration
//! - [`observability`]: Metrics and tracing setup
//! - [`storage`]: Pool, batches, engine and maintenance

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,    // storage::StorageEngine is fine
    clippy::must_use_candidate,         // Not all functions need #[must_use]
    clippy::missing_errors_doc,         // Error docs can be verbose
    clippy::missing_panics_doc,         // Panic docs can be verbose
    clippy::needless_raw_string_hashes, // r#""# is fine for SQL
    clippy::cast_possible_truncation,   // SQLite counts are non-negative i64
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::too_many_lines              // Some functions are inherently long
)]

pub mod config;
pub mod observability;
pub mod storage;

use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) row ID.
///
/// # Example
///
/// ```
/// let id = chatstore::generate_id();
/// assert!(id.len() == 36); // UUID string format
/// ```
#[must_use]
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get the current Unix timestamp in milliseconds.
///
/// Clocks set before the epoch read as 0.
#[must_use]
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
