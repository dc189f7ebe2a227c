//! Bounded connection pool with blocking acquisition and an idle reaper.
//!
//! The pool never holds more than `max_connections` handles. Slots for new
//! connections are reserved under the pool mutex before the physical open, so
//! concurrent misses cannot overshoot the bound. Callers that find the pool at
//! capacity wait on a condition variable until a connection is released or
//! their timeout elapses.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::connection::PooledConnection;
use super::error::{StorageError, StorageResult};
use crate::observability::metrics::{record_pool_exhausted, record_pool_wait};

/// Sizing and timing for a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened at start-up and kept through idle reaping.
    pub min_connections: usize,
    /// Hard upper bound on open connections.
    pub max_connections: usize,
    /// Idle time after which a connection above `min_connections` is closed.
    pub max_idle_time: Duration,
    /// How often the reaper sweeps. Zero disables the reaper thread.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_idle_time: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> StorageResult<()> {
        if self.max_connections == 0 {
            return Err(StorageError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(StorageError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionPoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub created: u64,
    pub closed: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub wait_time_total_ms: f64,
    pub max_wait_time_ms: f64,
    pub avg_wait_time_ms: f64,
}

#[derive(Debug, Default)]
struct PoolState {
    connections: HashMap<u64, Arc<PooledConnection>>,
    /// Idle ids; acquisition takes from the back so cold connections drift
    /// to the front where the reaper finds them.
    idle: VecDeque<u64>,
    /// Slots reserved for connections currently being opened.
    pending: usize,
    next_id: u64,
    created: u64,
    closed: u64,
    hits: u64,
    misses: u64,
    acquisitions: u64,
    wait_total: Duration,
    wait_max: Duration,
    shut_down: bool,
}

impl PoolState {
    fn reserved(&self) -> usize {
        self.connections.len() + self.pending
    }

    fn record_wait(&mut self, waited: Duration) {
        self.acquisitions += 1;
        self.wait_total += waited;
        if waited > self.wait_max {
            self.wait_max = waited;
        }
    }
}

#[derive(Debug)]
struct PoolShared {
    db_path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, conn: Arc<PooledConnection>) {
        conn.set_busy(false);

        let mut state = self.lock_state();
        if state.shut_down || conn.is_closed() {
            if state.connections.remove(&conn.id()).is_some() {
                state.closed += 1;
            }
            drop(state);
            if let Err(e) = conn.close() {
                tracing::warn!(connection_id = conn.id(), error = %e, "failed to close returned connection");
            }
        } else {
            state.idle.push_back(conn.id());
            drop(state);
        }
        self.available.notify_one();
    }

    fn reap_idle(&self) -> usize {
        let mut guard = self.lock_state();
        let state = &mut *guard;

        let mut to_close = Vec::new();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        while let Some(id) = state.idle.pop_front() {
            let stale = state.connections.get(&id).is_some_and(|conn| {
                !conn.is_busy() && conn.idle_for() > self.config.max_idle_time
            });
            if stale && state.reserved() > self.config.min_connections {
                if let Some(conn) = state.connections.remove(&id) {
                    state.closed += 1;
                    to_close.push(conn);
                }
            } else {
                kept.push_back(id);
            }
        }
        state.idle = kept;
        drop(guard);

        for conn in &to_close {
            if let Err(e) = conn.close() {
                tracing::warn!(connection_id = conn.id(), error = %e, "reaper failed to close idle connection");
            }
        }
        to_close.len()
    }
}

/// A connection on loan from the pool.
///
/// Returned to the pool exactly once when dropped, including during unwinding.
#[derive(Debug)]
pub struct PoolGuard {
    conn: Arc<PooledConnection>,
    shared: Arc<PoolShared>,
}

impl Deref for PoolGuard {
    type Target = PooledConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.shared.release(Arc::clone(&self.conn));
    }
}

struct Reaper {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Thread-safe pool of SQLite connections.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    reaper: Mutex<Option<Reaper>>,
}

impl ConnectionPool {
    /// Create a pool for the given database file.
    ///
    /// Opens `min_connections` handles eagerly and starts the idle reaper.
    pub fn new<P: AsRef<Path>>(db_path: P, config: PoolConfig) -> StorageResult<Self> {
        config.validate()?;
        let db_path = db_path.as_ref().to_path_buf();

        let mut state = PoolState::default();
        for _ in 0..config.min_connections {
            let id = state.next_id;
            state.next_id += 1;
            let conn = PooledConnection::open(id, &db_path)?;
            state.connections.insert(id, Arc::new(conn));
            state.idle.push_back(id);
            state.created += 1;
        }

        let shared = Arc::new(PoolShared {
            db_path,
            config,
            state: Mutex::new(state),
            available: Condvar::new(),
        });

        let reaper = if shared.config.cleanup_interval.is_zero() {
            None
        } else {
            Some(spawn_reaper(Arc::clone(&shared))?)
        };

        tracing::info!(
            path = %shared.db_path.display(),
            min = shared.config.min_connections,
            max = shared.config.max_connections,
            "Connection pool created"
        );

        Ok(Self {
            shared,
            reaper: Mutex::new(reaper),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a connection, waiting at most `timeout` for one to free up.
    ///
    /// Tries the idle queue first (hit), then opens a new connection if the
    /// pool is below capacity (miss), and otherwise blocks. A timeout too
    /// large to represent as a deadline waits without one.
    pub fn acquire(&self, timeout: Duration) -> StorageResult<PoolGuard> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut state = self.shared.lock_state();

        loop {
            if state.shut_down {
                return Err(StorageError::PoolClosed);
            }

            if let Some(id) = state.idle.pop_back() {
                let Some(conn) = state.connections.get(&id).cloned() else {
                    continue;
                };
                let waited = started.elapsed();
                state.hits += 1;
                state.record_wait(waited);
                drop(state);
                return Ok(self.lend(conn, waited));
            }

            if state.reserved() < self.shared.config.max_connections {
                let id = state.next_id;
                state.next_id += 1;
                state.pending += 1;
                state.misses += 1;
                drop(state);
                return self.open_reserved(id, started);
            }

            let Some(deadline) = deadline else {
                state = self
                    .shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = Instant::now();
            if now >= deadline {
                drop(state);
                tracing::warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    max = self.shared.config.max_connections,
                    "Connection pool exhausted"
                );
                record_pool_exhausted();
                return Err(StorageError::PoolExhausted { timeout });
            }

            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Return a connection to the pool. Equivalent to dropping the guard.
    pub fn release(&self, guard: PoolGuard) {
        drop(guard);
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> ConnectionPoolStats {
        let state = self.shared.lock_state();
        let total = state.connections.len();
        let idle = state.idle.len();
        let avg = if state.acquisitions == 0 {
            0.0
        } else {
            duration_ms(state.wait_total) / state.acquisitions as f64
        };
        ConnectionPoolStats {
            total,
            active: total - idle,
            idle,
            created: state.created,
            closed: state.closed,
            pool_hits: state.hits,
            pool_misses: state.misses,
            wait_time_total_ms: duration_ms(state.wait_total),
            max_wait_time_ms: duration_ms(state.wait_max),
            avg_wait_time_ms: avg,
        }
    }

    /// Close idle connections past `max_idle_time`, down to `min_connections`.
    ///
    /// Connections on loan are never touched. Returns the number closed.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Close every idle connection and reject further acquisitions.
    ///
    /// Connections still on loan are closed when their guards drop.
    pub fn shutdown(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            let _ = reaper.stop_tx.send(());
            if reaper.handle.join().is_err() {
                tracing::warn!("reaper thread panicked");
            }
        }

        let mut state = self.shared.lock_state();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let idle_ids: Vec<u64> = state.idle.drain(..).collect();
        let idle_conns: Vec<_> = idle_ids
            .iter()
            .filter_map(|id| state.connections.remove(id))
            .collect();
        state.closed += idle_conns.len() as u64;
        let on_loan = state.connections.len();
        drop(state);

        self.shared.available.notify_all();
        for conn in &idle_conns {
            if let Err(e) = conn.close() {
                tracing::warn!(connection_id = conn.id(), error = %e, "failed to close connection during shutdown");
            }
        }
        tracing::info!(closed = idle_conns.len(), on_loan, "Connection pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock_state().shut_down
    }

    fn open_reserved(&self, id: u64, started: Instant) -> StorageResult<PoolGuard> {
        match PooledConnection::open(id, &self.shared.db_path) {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let waited = started.elapsed();
                let mut state = self.shared.lock_state();
                state.pending -= 1;
                state.created += 1;
                if state.shut_down {
                    state.closed += 1;
                    drop(state);
                    let _ = conn.close();
                    return Err(StorageError::PoolClosed);
                }
                state.connections.insert(id, Arc::clone(&conn));
                state.record_wait(waited);
                drop(state);
                tracing::debug!(connection_id = id, "opened new pooled connection");
                Ok(self.lend(conn, waited))
            }
            Err(e) => {
                self.shared.lock_state().pending -= 1;
                self.shared.available.notify_one();
                Err(e)
            }
        }
    }

    fn lend(&self, conn: Arc<PooledConnection>, waited: Duration) -> PoolGuard {
        conn.set_busy(true);
        record_pool_wait(waited.as_secs_f64());
        PoolGuard {
            conn,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_reaper(shared: Arc<PoolShared>) -> StorageResult<Reaper> {
    let (stop_tx, stop_rx) = mpsc::channel();
    let interval = shared.config.cleanup_interval;

    let handle = thread::Builder::new()
        .name("chatstore-reaper".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let reaped = shared.reap_idle();
                    if reaped > 0 {
                        tracing::debug!(reaped, "closed idle connections");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

    Ok(Reaper { stop_tx, handle })
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
