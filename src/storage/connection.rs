//! A single pooled SQLite connection.
//!
//! The physical handle sits behind a private mutex so it is never used by two
//! callers at once, even if a pooling bug were to hand it out twice.

use rusqlite::types::{FromSql, FromSqlError, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::error::{StorageError, StorageResult};
use super::schema::apply_pragmas;

/// One result row with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw values in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Raw value of a named column.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|idx| &self.values[idx])
    }

    /// Decode a named column.
    pub fn get<T: FromSql>(&self, column: &str) -> rusqlite::Result<T> {
        let idx = self
            .index_of(column)
            .ok_or_else(|| rusqlite::Error::InvalidColumnName(column.to_string()))?;
        self.get_idx(idx)
    }

    /// Decode a column by position.
    pub fn get_idx<T: FromSql>(&self, idx: usize) -> rusqlite::Result<T> {
        let value = self
            .values
            .get(idx)
            .ok_or(rusqlite::Error::InvalidColumnIndex(idx))?;
        T::column_result(ValueRef::from(value)).map_err(|e| match e {
            FromSqlError::InvalidType => rusqlite::Error::InvalidColumnType(
                idx,
                self.columns[idx].clone(),
                value.data_type(),
            ),
            other => rusqlite::Error::FromSqlConversionFailure(idx, value.data_type(), Box::new(other)),
        })
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// A physical database handle owned by the pool.
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    handle: Mutex<Option<Connection>>,
    created_at: Instant,
    /// Milliseconds after `created_at` at which the handle was last used.
    last_used_ms: AtomicU64,
    query_count: AtomicU64,
    busy: AtomicBool,
}

impl PooledConnection {
    /// Open a new connection to the database file and apply pragmas.
    pub fn open<P: AsRef<Path>>(id: u64, db_path: P) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;

        Ok(Self {
            id,
            handle: Mutex::new(Some(conn)),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            busy: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of statements run through this connection.
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_handle().is_none()
    }

    /// Time since the connection was last used (or opened).
    pub fn idle_for(&self) -> Duration {
        let last_used = self.created_at
            + Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        last_used.elapsed()
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
        if !busy {
            self.touch();
        }
    }

    /// Execute one statement.
    ///
    /// Returns the affected row count and any result rows. For statements that
    /// produce columns the count is the number of rows returned.
    pub fn execute(&self, sql: &str, params: &[Value]) -> StorageResult<(usize, Vec<Row>)> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            if stmt.column_count() == 0 {
                let affected = stmt.execute(params_from_iter(params.iter()))?;
                return Ok((affected, Vec::new()));
            }

            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let width = columns.len();

            let mut out = Vec::new();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for idx in 0..width {
                    values.push(row.get::<_, Value>(idx)?);
                }
                out.push(Row {
                    columns: Arc::clone(&columns),
                    values,
                });
            }
            Ok((out.len(), out))
        })
    }

    /// Execute one statement once per parameter tuple inside a transaction.
    ///
    /// The whole list commits or rolls back together.
    pub fn execute_many(&self, sql: &str, param_list: &[Vec<Value>]) -> StorageResult<usize> {
        if param_list.is_empty() {
            return Ok(0);
        }
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let mut affected = 0;
            {
                let mut stmt = tx.prepare_cached(sql)?;
                for params in param_list {
                    affected += stmt.execute(params_from_iter(params.iter()))?;
                }
            }
            tx.commit()?;
            Ok(affected)
        })
    }

    /// Run a closure against the physical handle while holding the lock.
    pub fn with_connection<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T>,
    {
        let mut guard = self.lock_handle();
        let conn = guard
            .as_mut()
            .ok_or(StorageError::ConnectionClosed { id: self.id })?;
        self.query_count.fetch_add(1, Ordering::Relaxed);
        let result = f(conn);
        self.touch();
        result
    }

    /// Close the physical handle. Safe to call more than once.
    pub fn close(&self) -> StorageResult<()> {
        let taken = self.lock_handle().take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| StorageError::Statement(e))?;
            tracing::debug!(connection_id = self.id, "connection closed");
        }
        Ok(())
    }

    fn touch(&self) {
        let offset = self.created_at.elapsed().as_millis();
        self.last_used_ms
            .store(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<Connection>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
