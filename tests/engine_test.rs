//! End-to-end tests for the storage engine.
//!
//! Tests:
//! - Pagination totals and has_more across page boundaries
//! - Case-insensitive content search scoped by owner and session
//! - Cascade delete and trigger-maintained message counts
//! - Dry-run cleanup counting exactly what a live run removes
//! - Concurrent writers sharing one engine
//! - Stats ring capacity and retention of recent errors

mod common;

use chatstore::config::StorageConfig;
use chatstore::storage::{QueryKind, SortOrder, StorageEngine, StorageError};
use common::{message_at, seed_session, TestFixture};
use rusqlite::types::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_fifty_messages_paginate_in_twenties() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");

    let batch: Vec<_> = (0..50)
        .map(|i| message_at("s1", &format!("message {i}"), 10_000 + i))
        .collect();
    assert_eq!(engine.save_messages_batch(&batch).unwrap(), 50);

    let first = engine
        .list_messages_paginated("s1", 20, 0, SortOrder::Asc)
        .unwrap();
    assert_eq!(first.rows.len(), 20);
    assert_eq!(first.total_count, 50);
    assert!(first.has_more);
    assert_eq!(first.rows[0].content, "message 0");

    let last = engine
        .list_messages_paginated("s1", 20, 40, SortOrder::Asc)
        .unwrap();
    assert_eq!(last.rows.len(), 10);
    assert_eq!(last.total_count, 50);
    assert!(!last.has_more);
    assert_eq!(last.rows[9].content, "message 49");

    let past_end = engine
        .list_messages_paginated("s1", 20, 60, SortOrder::Asc)
        .unwrap();
    assert!(past_end.rows.is_empty());
    assert_eq!(past_end.total_count, 50);
    assert!(!past_end.has_more);
}

#[test]
fn test_page_walk_reproduces_dataset_once() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");

    // Duplicate timestamps force the id tiebreak to keep the walk stable.
    let batch: Vec<_> = (0..50)
        .map(|i| message_at("s1", &format!("m{i:02}"), 100 + i / 3))
        .collect();
    engine.save_messages_batch(&batch).unwrap();

    let expected = engine
        .list_messages_paginated("s1", 100, 0, SortOrder::Desc)
        .unwrap()
        .rows;
    let mut walked = Vec::new();
    let mut offset = 0;
    loop {
        let page = engine
            .list_messages_paginated("s1", 7, offset, SortOrder::Desc)
            .unwrap();
        offset += page.rows.len() as u64;
        let done = !page.has_more;
        walked.extend(page.rows);
        if done {
            break;
        }
    }
    assert_eq!(walked, expected);
    assert_eq!(walked.len(), 50);
}

#[test]
fn test_search_finds_two_of_five() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");
    seed_session(&engine, "s2", "u2");

    engine
        .save_messages_batch(&[
            message_at("s1", "Intro to Machine Learning", 1),
            message_at("s1", "cooking pasta", 2),
            message_at("s1", "why machine learning models overfit", 3),
            message_at("s1", "learning the machine shop", 4),
            message_at("s1", "weather report", 5),
        ])
        .unwrap();
    engine
        .save_messages_batch(&[message_at("s2", "machine learning elsewhere", 6)])
        .unwrap();

    let hits = engine
        .search_messages("machine learning", Some("u1"), None, 10)
        .unwrap();
    let contents: Vec<_> = hits.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["why machine learning models overfit", "Intro to Machine Learning"]
    );

    let everywhere = engine
        .search_messages("machine learning", None, None, 10)
        .unwrap();
    assert_eq!(everywhere.len(), 3);

    let capped = engine
        .search_messages("machine learning", None, None, 1)
        .unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].session_id, "s2");

    let scoped = engine
        .search_messages("machine learning", None, Some("s2"), 10)
        .unwrap();
    assert_eq!(scoped.len(), 1);
}

#[test]
fn test_delete_session_cascades_to_messages() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");
    engine
        .save_messages_batch(&[message_at("s1", "a", 1), message_at("s1", "b", 2)])
        .unwrap();

    assert!(engine.delete_session("s1").unwrap());
    let remaining = engine
        .execute_query("SELECT COUNT(*) AS n FROM chat_messages", &[], QueryKind::Select)
        .unwrap();
    assert_eq!(remaining.rows[0].get::<i64>("n").unwrap(), 0);
    assert!(engine.get_session_with_stats("s1").unwrap().is_none());
}

#[test]
fn test_message_count_tracks_inserts() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");

    let batch: Vec<_> = (0..7).map(|i| message_at("s1", "x", 5_000 + i)).collect();
    engine.save_messages_batch(&batch).unwrap();

    let stats = engine.get_session_with_stats("s1").unwrap().unwrap();
    assert_eq!(stats.session.message_count, 7);
    assert_eq!(stats.actual_message_count, 7);
    assert_eq!(stats.last_message_at, Some(5_006));
    assert_eq!(stats.session.updated_at, 5_006);

    let page = engine.list_sessions_paginated(Some("u1"), 10, 0, false).unwrap();
    assert_eq!(page.rows[0].message_count, 7);
}

#[test]
fn test_cleanup_dry_run_parity() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    for id in ["keep", "old"] {
        seed_session(&engine, id, "u1");
        engine
            .save_messages_batch(&[message_at(id, "hello", 2_000), message_at(id, "bye", 2_001)])
            .unwrap();
    }
    engine.archive_session("old", true).unwrap();
    engine
        .execute_query(
            "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
            &[Value::Integer(3_000), Value::Text("old".into())],
            QueryKind::Update,
        )
        .unwrap();

    let preview = engine.cleanup_older_than(4_000, true).unwrap();
    assert_eq!((preview.sessions, preview.messages), (1, 2));

    let live = engine.cleanup_older_than(4_000, false).unwrap();
    assert_eq!(
        (live.sessions, live.messages, live.performance_rows),
        (preview.sessions, preview.messages, preview.performance_rows)
    );
    assert!(engine.get_session_with_stats("keep").unwrap().is_some());
    assert!(engine.get_session_with_stats("old").unwrap().is_none());
}

#[test]
fn test_concurrent_writers_share_engine() {
    let fixture = TestFixture::new();
    let engine = Arc::new(StorageEngine::open(StorageConfig {
        max_connections: 3,
        acquire_timeout: Duration::from_secs(10),
        ..fixture.config()
    })
    .unwrap());
    seed_session(&engine, "s1", "u1");

    let writers: Vec<_> = (0..6)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let batch: Vec<_> = (0..25)
                    .map(|i| message_at("s1", &format!("w{w} m{i}"), w * 100 + i))
                    .collect();
                engine.save_messages_batch(&batch).unwrap()
            })
        })
        .collect();
    let written: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(written, 150);

    let stats = engine.get_session_with_stats("s1").unwrap().unwrap();
    assert_eq!(stats.session.message_count, 150);
    assert!(engine.pool().stats().total <= 3);
}

#[test]
fn test_stats_ring_keeps_latest_and_errors() {
    let fixture = TestFixture::new();
    let engine = StorageEngine::open(StorageConfig {
        stats_ring_capacity: 5,
        ..fixture.config()
    })
    .unwrap();

    let _ = engine.execute_query("SELECT * FROM missing", &[], QueryKind::Select);
    for _ in 0..10 {
        engine.health_check().unwrap();
    }
    let report = engine.performance_stats();
    assert_eq!(report.total_queries, 5);
    assert!(report.recent_errors.is_empty(), "error was evicted");

    let err = engine
        .execute_query("INSERT INTO nowhere VALUES (1)", &[], QueryKind::Insert)
        .unwrap_err();
    assert!(matches!(err, StorageError::Statement(_)));
    let report = engine.performance_stats();
    assert_eq!(report.recent_errors.len(), 1);
    assert_eq!(report.recent_errors[0].kind, QueryKind::Insert);
    assert_eq!(report.by_kind[&QueryKind::Insert].errors, 1);
}

#[test]
fn test_closed_engine_rejects_work() {
    let fixture = TestFixture::new();
    let engine = fixture.engine();
    seed_session(&engine, "s1", "u1");
    engine.close();

    let err = engine
        .save_messages_batch(&[message_at("s1", "late", 1)])
        .unwrap_err();
    assert!(matches!(err, StorageError::PoolClosed));
    assert!(!err.is_retriable());

    // Empty input never reaches the pool.
    assert_eq!(engine.save_messages_batch(&[]).unwrap(), 0);
}
