//! Session reads and writes.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::engine::StorageEngine;
use super::error::StorageResult;
use super::models::{json_from_sql, json_to_sql, NewSession, Page, Session, SessionWithStats};
use super::stats::QueryKind;
use crate::{generate_id, now_millis};

const SESSION_COLUMNS: &str = "s.id, s.title, s.model_id, s.user_id, s.created_at, \
                               s.updated_at, s.message_count, s.is_archived, s.metadata";

/// Filter shared by the session page query and its count query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter<'a> {
    pub owner_id: Option<&'a str>,
    pub include_archived: bool,
}

impl SessionFilter<'_> {
    /// `WHERE` clause (possibly empty) over alias `s` and its parameters.
    fn predicate(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(owner) = self.owner_id {
            params.push(Value::Text(owner.to_string()));
            clauses.push(format!("s.user_id = ?{}", params.len()));
        }
        if !self.include_archived {
            clauses.push("s.is_archived = 0".to_string());
        }
        let sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (sql, params)
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        model_id: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        message_count: row.get(6)?,
        is_archived: row.get(7)?,
        metadata: json_from_sql(8, row.get(8)?)?,
    })
}

impl StorageEngine {
    /// Insert a new session and return it as stored.
    pub fn create_session(&self, new: &NewSession) -> StorageResult<Session> {
        let now = now_millis();
        let session = Session {
            id: new.id.clone().unwrap_or_else(generate_id),
            title: new.title.clone(),
            model_id: new.model_id.clone(),
            user_id: new.user_id.clone(),
            created_at: new.created_at.unwrap_or(now),
            updated_at: new.created_at.unwrap_or(now),
            message_count: 0,
            is_archived: false,
            metadata: new.metadata.clone(),
        };
        let metadata = json_to_sql(session.metadata.as_ref())?;

        let sql = "INSERT INTO chat_sessions
                   (id, title, model_id, user_id, created_at, updated_at, message_count, is_archived, metadata)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)";
        self.instrumented(QueryKind::Insert, sql, |conn| {
            conn.with_connection(|c| {
                let n = c.execute(
                    sql,
                    params![
                        session.id,
                        session.title,
                        session.model_id,
                        session.user_id,
                        session.created_at,
                        session.updated_at,
                        metadata,
                    ],
                )?;
                Ok(((), n))
            })
        })?;

        tracing::debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Set or clear the archived flag. Returns false if the session is unknown.
    pub fn archive_session(&self, session_id: &str, archived: bool) -> StorageResult<bool> {
        let sql = "UPDATE chat_sessions SET is_archived = ?1, updated_at = ?2 WHERE id = ?3";
        self.instrumented(QueryKind::Update, sql, |conn| {
            conn.with_connection(|c| {
                let n = c.execute(sql, params![archived, now_millis(), session_id])?;
                Ok((n > 0, n))
            })
        })
    }

    /// Delete a session and, by cascade, its messages.
    ///
    /// Returns false if the session is unknown.
    pub fn delete_session(&self, session_id: &str) -> StorageResult<bool> {
        let sql = "DELETE FROM chat_sessions WHERE id = ?1";
        self.instrumented(QueryKind::Delete, sql, |conn| {
            conn.with_connection(|c| {
                let n = c.execute(sql, params![session_id])?;
                Ok((n > 0, n))
            })
        })
    }

    /// A session joined with aggregates over its messages, or `None`.
    pub fn get_session_with_stats(&self, session_id: &str) -> StorageResult<Option<SessionWithStats>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS},
                    COUNT(m.id),
                    MAX(m.timestamp),
                    COALESCE(SUM(m.tokens_used), 0),
                    AVG(m.response_time)
             FROM chat_sessions s
             LEFT JOIN chat_messages m ON m.session_id = s.id
             WHERE s.id = ?1
             GROUP BY s.id"
        );
        self.instrumented(QueryKind::Select, &sql, |conn| {
            conn.with_connection(|c| {
                let found = c
                    .query_row(&sql, params![session_id], |row| {
                        Ok(SessionWithStats {
                            session: session_from_row(row)?,
                            actual_message_count: row.get(9)?,
                            last_message_at: row.get(10)?,
                            total_tokens: row.get(11)?,
                            avg_response_time: row.get(12)?,
                        })
                    })
                    .optional()?;
                let rows = usize::from(found.is_some());
                Ok((found, rows))
            })
        })
    }

    /// One page of sessions, most recently updated first.
    ///
    /// `total_count` uses the same predicate as the page and both run in one
    /// read transaction.
    pub fn list_sessions_paginated(
        &self,
        owner_id: Option<&str>,
        limit: u32,
        offset: u64,
        include_archived: bool,
    ) -> StorageResult<Page<Session>> {
        let filter = SessionFilter {
            owner_id,
            include_archived,
        };
        let (predicate, mut params) = filter.predicate();
        let count_sql = format!("SELECT COUNT(*) FROM chat_sessions s{predicate}");
        let page_sql = format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions s{predicate}
             ORDER BY s.updated_at DESC, s.id ASC
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
                        .query_map(params_from_iter(params.iter()), session_from_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                tx.commit()?;
                let n = rows.len();
                Ok((Page::new(rows, total as u64, offset), n))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_engine() -> (TempDir, StorageEngine) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            cleanup_interval: Duration::ZERO,
            ..StorageConfig::new(temp_dir.path().join("sessions.db"))
        };
        (temp_dir, StorageEngine::open(config).unwrap())
    }

    fn new_session(id: &str, owner: &str, created_at: i64) -> NewSession {
        NewSession {
            id: Some(id.to_string()),
            title: format!("session {id}"),
            model_id: Some("model-a".to_string()),
            user_id: Some(owner.to_string()),
            created_at: Some(created_at),
            metadata: Some(serde_json::json!({"tag": id})),
        }
    }

    #[test]
    fn test_filter_predicate() {
        let (sql, params) = SessionFilter::default().predicate();
        assert_eq!(sql, " WHERE s.is_archived = 0");
        assert!(params.is_empty());

        let filter = SessionFilter {
            owner_id: Some("u1"),
            include_archived: true,
        };
        let (sql, params) = filter.predicate();
        assert_eq!(sql, " WHERE s.user_id = ?1");
        assert_eq!(params, vec![Value::Text("u1".into())]);
    }

    #[test]
    fn test_create_and_fetch_with_stats() {
        let (_dir, engine) = test_engine();
        let created = engine.create_session(&new_session("s1", "u1", 1_000)).unwrap();
        assert_eq!(created.id, "s1");

        let found = engine.get_session_with_stats("s1").unwrap().unwrap();
        assert_eq!(found.session.title, "session s1");
        assert_eq!(found.session.metadata, Some(serde_json::json!({"tag": "s1"})));
        assert_eq!(found.actual_message_count, 0);
        assert_eq!(found.last_message_at, None);
        assert_eq!(found.total_tokens, 0);
        assert_eq!(found.avg_response_time, None);
    }

    #[test]
    fn test_missing_session_is_none() {
        let (_dir, engine) = test_engine();
        assert!(engine.get_session_with_stats("nope").unwrap().is_none());
        assert!(!engine.delete_session("nope").unwrap());
    }

    #[test]
    fn test_generated_id_when_absent() {
        let (_dir, engine) = test_engine();
        let session = engine
            .create_session(&NewSession {
                title: "untitled".into(),
                ..NewSession::default()
            })
            .unwrap();
        assert_eq!(session.id.len(), 36);
    }

    #[test]
    fn test_list_filters_owner_and_archived() {
        let (_dir, engine) = test_engine();
        engine.create_session(&new_session("a", "u1", 1)).unwrap();
        engine.create_session(&new_session("b", "u1", 2)).unwrap();
        engine.create_session(&new_session("c", "u2", 3)).unwrap();
        assert!(engine.archive_session("b", true).unwrap());

        let page = engine.list_sessions_paginated(Some("u1"), 10, 0, false).unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.rows[0].id, "a");
        assert!(!page.has_more);

        let page = engine.list_sessions_paginated(Some("u1"), 10, 0, true).unwrap();
        assert_eq!(page.total_count, 2);

        let page = engine.list_sessions_paginated(None, 1, 0, true).unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.rows.len(), 1);
        assert!(page.has_more);
    }

    #[test]
    fn test_page_walk_breaks_ties_by_id() {
        let (_dir, engine) = test_engine();
        let seeded = [
            ("f", 100),
            ("b", 300),
            ("h", 100),
            ("a", 200),
            ("g", 300),
            ("c", 100),
            ("e", 300),
            ("d", 200),
        ];
        for (id, at) in seeded {
            engine.create_session(&new_session(id, "u1", at)).unwrap();
        }

        let mut walked = Vec::new();
        let mut offset = 0;
        loop {
            let page = engine.list_sessions_paginated(None, 3, offset, true).unwrap();
            assert_eq!(page.total_count, 8);
            offset += page.rows.len() as u64;
            walked.extend(page.rows.into_iter().map(|s| s.id));
            if !page.has_more {
                break;
            }
            assert!(offset < 8);
        }
        assert_eq!(offset, 8);

        let ids: Vec<&str> = walked.iter().map(String::as_str).collect();
        assert_eq!(ids, ["b", "e", "g", "a", "d", "c", "f", "h"]);

        let single = engine.list_sessions_paginated(None, 100, 0, true).unwrap();
        assert!(!single.has_more);
        let single: Vec<String> = single.rows.into_iter().map(|s| s.id).collect();
        assert_eq!(single, walked);
    }
}
