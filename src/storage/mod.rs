//! SQLite storage layer for chatstore.
//!
//! Provides:
//! - A bounded connection pool with an idle reaper
//! - Chunked batch writes over a single borrowed connection
//! - Instrumented session and message queries with shared count/page filters
//! - Retention cleanup and compaction

pub mod batch;
pub mod connection;
pub mod engine;
pub mod error;
pub mod maintenance;
pub mod messages;
pub mod models;
pub mod pool;
pub mod schema;
pub mod sessions;
pub mod stats;

pub use batch::BatchOperation;
pub use connection::{PooledConnection, Row};
pub use engine::{QueryResult, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use messages::MessageFilter;
pub use models::{
    CleanupReport, Message, NewMessage, NewSession, OptimizeReport, Page, Role, Session,
    SessionWithStats, SortOrder,
};
pub use pool::{ConnectionPool, ConnectionPoolStats, PoolConfig, PoolGuard};
pub use sessions::SessionFilter;
pub use stats::{PerformanceReport, QueryKind, QueryStat};
