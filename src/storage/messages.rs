//! Message writes, paginated reads and content search.

use rusqlite::params_from_iter;
use rusqlite::types::Value;
use sha2::{Digest, Sha256};

use super::engine::StorageEngine;
use super::error::StorageResult;
use super::models::{json_from_sql, json_to_sql, Message, NewMessage, Page, SortOrder};
use super::stats::QueryKind;
use crate::{generate_id, now_millis};

const MESSAGE_COLUMNS: &str = "m.id, m.session_id, m.role, m.content, m.timestamp, m.model_id, \
                               m.tokens_used, m.response_time, m.metadata, m.content_hash, \
                               m.content_length, m.is_encrypted";

const INSERT_MESSAGE: &str = "INSERT INTO chat_messages
    (id, session_id, role, content, timestamp, model_id, tokens_used, response_time,
     metadata, content_hash, content_length, is_encrypted)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Filter shared by message page, count and search queries.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter<'a> {
    pub session_id: Option<&'a str>,
    /// Restricts to sessions owned by this user (joins `chat_sessions`).
    pub owner_id: Option<&'a str>,
    /// Case-insensitive substring of the content.
    pub content_contains: Option<&'a str>,
}

impl MessageFilter<'_> {
    /// `FROM ... WHERE ...` fragment over alias `m` and its parameters.
    fn source(&self) -> (String, Vec<Value>) {
        let mut sql = String::from(" FROM chat_messages m");
        if self.owner_id.is_some() {
            sql.push_str(" JOIN chat_sessions s ON s.id = m.session_id");
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(session_id) = self.session_id {
            params.push(Value::Text(session_id.to_string()));
            clauses.push(format!("m.session_id = ?{}", params.len()));
        }
        if let Some(owner) = self.owner_id {
            params.push(Value::Text(owner.to_string()));
            clauses.push(format!("s.user_id = ?{}", params.len()));
        }
        if let Some(term) = self.content_contains {
            params.push(Value::Text(format!("%{}%", escape_like(term))));
            clauses.push(format!("m.content LIKE ?{} ESCAPE '\\'", params.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        (sql, params)
    }
}

/// Escape LIKE wildcards so the term matches literally.
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Hex SHA-256 of message content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        model_id: row.get(5)?,
        tokens_used: row.get(6)?,
        response_time: row.get(7)?,
        metadata: json_from_sql(8, row.get(8)?)?,
        content_hash: row.get(9)?,
        content_length: row.get(10)?,
        is_encrypted: row.get(11)?,
    })
}

fn insert_params(msg: &NewMessage, now: i64) -> StorageResult<Vec<Value>> {
    let metadata = json_to_sql(msg.metadata.as_ref())?;
    let content_length = i64::try_from(msg.content.chars().count()).unwrap_or(i64::MAX);
    Ok(vec![
        Value::Text(msg.id.clone().unwrap_or_else(generate_id)),
        Value::Text(msg.session_id.clone()),
        Value::Text(msg.role.as_str().to_string()),
        Value::Text(msg.content.clone()),
        Value::Integer(msg.timestamp.unwrap_or(now)),
        msg.model_id.clone().map_or(Value::Null, Value::Text),
        msg.tokens_used.map_or(Value::Null, Value::Integer),
        msg.response_time.map_or(Value::Null, Value::Real),
        metadata.map_or(Value::Null, Value::Text),
        Value::Text(content_hash(&msg.content)),
        Value::Integer(content_length),
        Value::Integer(i64::from(msg.is_encrypted)),
    ])
}

impl StorageEngine {
    /// Insert messages as one batch. Returns the number of rows written.
    ///
    /// Empty input returns 0 without touching the pool. Session
    /// `message_count` and `updated_at` follow via triggers.
    pub fn save_messages_batch(&self, messages: &[NewMessage]) -> StorageResult<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let now = now_millis();
        let mut batch = self.new_batch(QueryKind::Insert, "chat_messages");
        for msg in messages {
            batch.add(INSERT_MESSAGE, insert_params(msg, now)?);
        }
        let written = self.execute_batch(batch)?;
        tracing::debug!(rows = written, "messages saved");
        Ok(written)
    }

    /// One page of a session's messages ordered by timestamp.
    pub fn list_messages_paginated(
        &self,
        session_id: &str,
        limit: u32,
        offset: u64,
        order: SortOrder,
    ) -> StorageResult<Page<Message>> {
        let filter = MessageFilter {
            session_id: Some(session_id),
            ..MessageFilter::default()
        };
        let (source, mut params) = filter.source();
        let direction = order.as_sql();
        let count_sql = format!("SELECT COUNT(*){source}");
        let page_sql = format!(
            "SELECT {MESSAGE_COLUMNS}{source}
             ORDER BY m.timestamp {direction}, m.id {direction}
             LIMIT ?{} OFFSET ?{}",
            params.len() + 1,
            params.len() + 2
        );
        let filter_len = params.len();
        params.push(Value::Integer(i64::from(limit)));
        params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));

        self.instrumented(QueryKind::Select, &page_sql, |conn| {
            conn.with_connection(|c| {
                let tx = c.transaction()?;
                let total: i64 = tx.query_row(
                    &count_sql,
                    params_from_iter(params[..filter_len].iter()),
                    |row| row.get(0),
                )?;
                let rows = {
                    let mut stmt = tx.prepare_cached(&page_sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(params.iter()), message_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                tx.commit()?;
                let n = rows.len();
                Ok((Page::new(rows, total as u64, offset), n))
            })
        })
    }

    /// Case-insensitive substring search over message content, newest first.
    ///
    /// An empty term matches nothing. Whitespace is searched for literally.
    pub fn search_messages(
        &self,
        term: &str,
        owner_id: Option<&str>,
        session_id: Option<&str>,
        limit: u32,
    ) -> StorageResult<Vec<Message>> {
        if term.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let filter = MessageFilter {
            session_id,
            owner_id,
            content_contains: Some(term),
        };
        let (source, mut params) = filter.source();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}{source}
             ORDER BY m.timestamp DESC, m.id DESC
             LIMIT ?{}",
            params.len() + 1
        );
        params.push(Value::Integer(i64::from(limit)));

        self.instrumented(QueryKind::Select, &sql, |conn| {
            conn.with_connection(|c| {
                let mut stmt = c.prepare_cached(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(params.iter()), message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                let n = rows.len();
                Ok((rows, n))
            })
        })
    }
}
