//! Row types read and written by the engine.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Listing order for paginated reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// A stored chat session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub model_id: Option<String>,
    pub user_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: i64,
    pub is_archived: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Input for creating a session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewSession {
    /// Generated (UUIDv7) when absent.
    pub id: Option<String>,
    pub title: String,
    pub model_id: Option<String>,
    pub user_id: Option<String>,
    /// Defaults to now.
    pub created_at: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

/// A session joined with aggregates over its messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionWithStats {
    pub session: Session,
    pub actual_message_count: i64,
    pub last_message_at: Option<i64>,
    pub total_tokens: i64,
    pub avg_response_time: Option<f64>,
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub response_time: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub content_hash: String,
    pub content_length: i64,
    pub is_encrypted: bool,
}

/// Input for writing a message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewMessage {
    /// Generated (UUIDv7) when absent.
    pub id: Option<String>,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Defaults to now.
    pub timestamp: Option<i64>,
    pub model_id: Option<String>,
    pub tokens_used: Option<i64>,
    pub response_time: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub is_encrypted: bool,
}

impl NewMessage {
    /// Minimal message with only the required fields set.
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: None,
            model_id: None,
            tokens_used: None,
            response_time: None,
            metadata: None,
            is_encrypted: false,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total_count: u64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub(crate) fn new(rows: Vec<T>, total_count: u64, offset: u64) -> Self {
        let has_more = offset.saturating_add(rows.len() as u64) < total_count;
        Self {
            rows,
            total_count,
            has_more,
        }
    }
}

/// Counts gathered (dry run) or deleted (live) by retention cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Unix epoch milliseconds; rows older than this were selected.
    pub cutoff: i64,
    pub sessions: u64,
    pub messages: u64,
    pub performance_rows: u64,
}

/// Result of a compaction and statistics-refresh pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptimizeReport {
    pub vacuum_ms: f64,
    pub analyze_ms: f64,
    pub page_size: i64,
    pub page_count: i64,
    pub size_bytes: i64,
    pub free_pages_before: i64,
    pub free_pages_after: i64,
    /// Free pages as a fraction of all pages after the pass.
    pub fragmentation_ratio: f64,
}

pub(crate) fn json_to_sql(value: Option<&serde_json::Value>) -> serde_json::Result<Option<String>> {
    value.map(serde_json::to_string).transpose()
}

pub(crate) fn json_from_sql(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}
