//! Schema initialization and connection pragmas.
//!
//! WAL mode lets paginated readers proceed while small transactional writes
//! commit. `synchronous=NORMAL` is durable across application crashes in WAL
//! mode and only risks the last transactions on power loss.

use rusqlite::Connection;
use std::time::Duration;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Page cache size in KiB (negative value means KiB to SQLite).
const CACHE_SIZE_KIB: i64 = 64_000;

/// Apply performance pragmas to a freshly opened connection.
///
/// Called exactly once per physical handle.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode reports the resulting mode as a row; in-memory databases
    // answer "memory" and that is fine.
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::trace!(journal_mode = %mode, "journal mode applied");

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Create tables and indexes if they do not exist yet.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            id            TEXT PRIMARY KEY,
            title         TEXT NOT NULL,
            model_id      TEXT,
            user_id       TEXT,
            created_at    INTEGER NOT NULL,
            updated_at    INTEGER NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            is_archived   INTEGER NOT NULL DEFAULT 0,
            metadata      TEXT
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id             TEXT PRIMARY KEY,
            session_id     TEXT NOT NULL
                           REFERENCES chat_sessions(id) ON DELETE CASCADE,
            role           TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
            content        TEXT NOT NULL,
            timestamp      INTEGER NOT NULL,
            model_id       TEXT,
            tokens_used    INTEGER,
            response_time  REAL,
            metadata       TEXT,
            content_hash   TEXT NOT NULL,
            content_length INTEGER NOT NULL,
            is_encrypted   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS query_performance (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            query_type     TEXT NOT NULL,
            query_hash     TEXT NOT NULL,
            execution_time REAL NOT NULL,
            rows_affected  INTEGER NOT NULL DEFAULT 0,
            timestamp      INTEGER NOT NULL,
            error_message  TEXT
        );

        CREATE TABLE IF NOT EXISTS cache_metadata (
            cache_key     TEXT PRIMARY KEY,
            created_at    INTEGER NOT NULL,
            expires_at    INTEGER,
            access_count  INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER,
            data_size     INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON chat_sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_updated
            ON chat_sessions(updated_at);
        CREATE INDEX IF NOT EXISTS idx_sessions_archived_updated
            ON chat_sessions(is_archived, updated_at);
        CREATE INDEX IF NOT EXISTS idx_messages_session_timestamp
            ON chat_messages(session_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp
            ON chat_messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_query_performance_timestamp
            ON query_performance(timestamp);

        -- message_count follows inserts and deletes; only inserts count as
        -- session activity for retention purposes.
        CREATE TRIGGER IF NOT EXISTS trg_messages_after_insert
        AFTER INSERT ON chat_messages
        BEGIN
            UPDATE chat_sessions
               SET message_count = message_count + 1,
                   updated_at = MAX(updated_at, NEW.timestamp)
             WHERE id = NEW.session_id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_messages_after_delete
        AFTER DELETE ON chat_messages
        BEGIN
            UPDATE chat_sessions
               SET message_count = MAX(message_count - 1, 0)
             WHERE id = OLD.session_id;
        END;
        "#,
    )
}
