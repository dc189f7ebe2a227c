//! Batched multi-row writes.
//!
//! A [`BatchOperation`] collects `(statement, params)` pairs, groups them by
//! identical statement text and runs each group in bounded chunks over one
//! borrowed connection. Each chunk is a single transaction.

use rusqlite::types::Value;
use std::collections::HashMap;
use std::time::Duration;

use super::error::StorageResult;
use super::pool::ConnectionPool;
use super::stats::QueryKind;

/// Default number of parameter tuples per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Accumulator of statements to execute as one batch.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    kind: QueryKind,
    table: String,
    entries: Vec<(String, Vec<Value>)>,
    chunk_size: usize,
}

impl BatchOperation {
    /// Create an empty batch. `table` is informational only.
    pub fn new(kind: QueryKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            entries: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk size (minimum 1).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn add(&mut self, statement: impl Into<String>, params: Vec<Value>) {
        self.entries.push((statement.into(), params));
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Group parameters by statement, in order of each statement's first use.
    ///
    /// Within a group the parameters keep their insertion order.
    pub fn into_groups(self) -> Vec<(String, Vec<Vec<Value>>)> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<Vec<Value>>)> = Vec::new();
        for (statement, params) in self.entries {
            match index.get(&statement) {
                Some(&slot) => groups[slot].1.push(params),
                None => {
                    index.insert(statement.clone(), groups.len());
                    groups.push((statement, vec![params]));
                }
            }
        }
        groups
    }

    /// Execute every group over a single connection.
    ///
    /// Returns total rows affected. An empty batch returns 0 without touching
    /// the pool.
    pub fn execute(self, pool: &ConnectionPool, timeout: Duration) -> StorageResult<usize> {
        if self.entries.is_empty() {
            return Ok(0);
        }

        let chunk_size = self.chunk_size;
        let table = self.table.clone();
        let groups = self.into_groups();

        let conn = pool.acquire(timeout)?;
        let mut total = 0;
        for (statement, params) in &groups {
            for chunk in params.chunks(chunk_size) {
                total += conn.execute_many(statement, chunk)?;
            }
        }

        tracing::debug!(
            table = %table,
            groups = groups.len(),
            rows = total,
            "batch executed"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::PoolConfig;
    use tempfile::TempDir;

    fn test_pool() -> (TempDir, ConnectionPool) {
        let temp_dir = TempDir::new().unwrap();
        let config = PoolConfig {
            min_connections: 1,
            max_connections: 2,
            cleanup_interval: Duration::ZERO,
            ..PoolConfig::default()
        };
        let pool = ConnectionPool::new(temp_dir.path().join("batch.db"), config).unwrap();
        let conn = pool.acquire(Duration::from_secs(1)).unwrap();
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, qty INTEGER)",
            &[],
        )
        .unwrap();
        drop(conn);
        (temp_dir, pool)
    }

    fn count_items(pool: &ConnectionPool) -> i64 {
        let conn = pool.acquire(Duration::from_secs(1)).unwrap();
        let (_, rows) = conn.execute("SELECT COUNT(*) AS n FROM items", &[]).unwrap();
        rows[0].get("n").unwrap()
    }

    #[test]
    fn test_groups_preserve_first_occurrence_order() {
        let mut batch = BatchOperation::new(QueryKind::Batch, "items");
        batch.add("B", vec![Value::Integer(1)]);
        batch.add("A", vec![Value::Integer(2)]);
        batch.add("B", vec![Value::Integer(3)]);

        let groups = batch.into_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "B");
        assert_eq!(groups[0].1, vec![vec![Value::Integer(1)], vec![Value::Integer(3)]]);
        assert_eq!(groups[1].0, "A");
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (_dir, pool) = test_pool();
        let before = pool.stats();
        let batch = BatchOperation::new(QueryKind::Insert, "items");
        assert_eq!(batch.execute(&pool, Duration::from_secs(1)).unwrap(), 0);
        let after = pool.stats();
        assert_eq!(before.pool_hits + before.pool_misses, after.pool_hits + after.pool_misses);
    }

    #[test]
    fn test_batch_inserts_every_row_in_chunks() {
        let (_dir, pool) = test_pool();
        let before = count_items(&pool);

        let mut batch = BatchOperation::new(QueryKind::Insert, "items").with_chunk_size(7);
        for i in 0..50 {
            batch.add(
                "INSERT INTO items (name, qty) VALUES (?1, ?2)",
                vec![Value::Text(format!("item-{i}")), Value::Integer(i)],
            );
        }
        let affected = batch.execute(&pool, Duration::from_secs(1)).unwrap();
        assert_eq!(affected, 50);
        assert_eq!(count_items(&pool) - before, 50);
    }

    #[test]
    fn test_mixed_statement_groups() {
        let (_dir, pool) = test_pool();

        let mut batch = BatchOperation::new(QueryKind::Batch, "items");
        for i in 0..3 {
            batch.add(
                "INSERT INTO items (id, name, qty) VALUES (?1, ?2, 0)",
                vec![Value::Integer(i), Value::Text(format!("n{i}"))],
            );
        }
        batch.add(
            "UPDATE items SET qty = qty + 1 WHERE id >= ?1",
            vec![Value::Integer(1)],
        );
        let affected = batch.execute(&pool, Duration::from_secs(1)).unwrap();
        assert_eq!(affected, 5);
    }

    #[test]
    fn test_batch_uses_single_acquisition() {
        let (_dir, pool) = test_pool();
        let before = pool.stats();

        let mut batch = BatchOperation::new(QueryKind::Insert, "items").with_chunk_size(2);
        for i in 0..9 {
            batch.add(
                "INSERT INTO items (name) VALUES (?1)",
                vec![Value::Text(format!("x{i}"))],
            );
        }
        batch.execute(&pool, Duration::from_secs(1)).unwrap();

        let after = pool.stats();
        assert_eq!(
            after.pool_hits + after.pool_misses,
            before.pool_hits + before.pool_misses + 1
        );
    }
}
