//! Test utilities for chatstore integration tests.
//!
//! Provides:
//! - Temporary database fixtures
//! - Engine construction with the idle reaper disabled
//! - Session and message seeding helpers

#![allow(dead_code)]

use chatstore::config::StorageConfig;
use chatstore::observability::tracing::init_test_tracing;
use chatstore::storage::{NewMessage, NewSession, Role, StorageEngine};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Test fixture that manages a temporary database directory.
///
/// The directory is automatically cleaned up when the fixture is dropped.
pub struct TestFixture {
    /// Temporary directory for test database
    pub temp_dir: TempDir,
    /// Path to the database file
    pub db_path: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with a temporary database directory.
    pub fn new() -> Self {
        init_test_tracing();
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");
        Self { temp_dir, db_path }
    }

    /// Get the database path as a string.
    pub fn db_path_str(&self) -> &str {
        self.db_path.to_str().expect("invalid path")
    }

    /// Storage config for this fixture with the reaper disabled.
    pub fn config(&self) -> StorageConfig {
        StorageConfig {
            cleanup_interval: Duration::ZERO,
            ..StorageConfig::new(&self.db_path)
        }
    }

    /// Open an engine with [`TestFixture::config`].
    pub fn engine(&self) -> StorageEngine {
        StorageEngine::open(self.config()).expect("failed to open engine")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a session owned by `owner`.
pub fn seed_session(engine: &StorageEngine, id: &str, owner: &str) {
    engine
        .create_session(&NewSession {
            id: Some(id.to_string()),
            title: format!("session {id}"),
            user_id: Some(owner.to_string()),
            created_at: Some(1_000),
            ..NewSession::default()
        })
        .expect("failed to create session");
}

/// A user message with an explicit timestamp.
pub fn message_at(session_id: &str, content: &str, timestamp: i64) -> NewMessage {
    NewMessage {
        timestamp: Some(timestamp),
        ..NewMessage::new(session_id, Role::User, content)
    }
}

/// Wait for a condition to become true with timeout.
///
/// Returns `true` if the condition was met before the timeout expired.
pub fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_creates_temp_dir() {
        let fixture = TestFixture::new();
        assert!(fixture.temp_dir.path().exists());
        assert!(fixture.db_path_str().contains("test.db"));
    }
}
