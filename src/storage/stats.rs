//! Rolling query-performance ledger.
//!
//! Every instrumented engine call records a [`QueryStat`] into a capped ring.
//! Once the ring is full the oldest entries are dropped. The ring has its own
//! lock, separate from the pool's, so recording never contends with
//! connection acquisition.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::pool::ConnectionPoolStats;
use crate::observability::metrics::record_query;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 10_000;

/// Number of recent errors included in a [`PerformanceReport`].
pub const RECENT_ERROR_LIMIT: usize = 10;

/// Statement category used for per-kind aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Batch,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Batch => "BATCH",
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable short hash of a statement's text, whitespace-normalised.
pub fn statement_fingerprint(sql: &str) -> String {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

/// One instrumented execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStat {
    pub kind: QueryKind,
    #[serde(rename = "duration_ms", serialize_with = "serialize_ms")]
    pub duration: Duration,
    pub rows_affected: usize,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub fingerprint: String,
    pub error: Option<String>,
}

fn serialize_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Per-kind aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KindStats {
    pub count: usize,
    pub avg_duration_ms: f64,
    pub errors: usize,
}

/// A failed execution as shown in reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentError {
    pub kind: QueryKind,
    pub fingerprint: String,
    pub error: String,
    pub timestamp: i64,
}

/// Aggregated view of the stats ring plus a pool snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_queries: usize,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub by_kind: BTreeMap<QueryKind, KindStats>,
    pub pool: ConnectionPoolStats,
    /// Most recent failures, newest first.
    pub recent_errors: Vec<RecentError>,
}

/// Capped, oldest-evicted ring of [`QueryStat`]s.
#[derive(Debug)]
pub struct StatsRing {
    capacity: usize,
    inner: Mutex<RingInner>,
}

#[derive(Debug, Default)]
struct RingInner {
    /// Sequence number of the next recorded stat.
    next_seq: u64,
    entries: VecDeque<(u64, QueryStat)>,
}

impl StatsRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(RingInner {
                next_seq: 0,
                entries: VecDeque::with_capacity(capacity.min(1024)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Append a stat, evicting the oldest entries past capacity.
    pub fn record(&self, stat: QueryStat) {
        record_query(
            stat.kind.as_str(),
            stat.duration.as_secs_f64(),
            stat.error.is_some(),
        );
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push_back((seq, stat));
        while inner.entries.len() > self.capacity {
            inner.entries.pop_front();
        }
    }

    /// Copy of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<QueryStat> {
        self.lock().entries.iter().map(|(_, stat)| stat.clone()).collect()
    }

    /// Stats recorded at or after sequence `from` that are still in the ring.
    ///
    /// Returns them oldest first with the sequence to pass next time.
    pub fn since(&self, from: u64) -> (Vec<QueryStat>, u64) {
        let inner = self.lock();
        let stats = inner
            .entries
            .iter()
            .filter(|(seq, _)| *seq >= from)
            .map(|(_, stat)| stat.clone())
            .collect();
        (stats, inner.next_seq)
    }

    /// Aggregate the ring into a report.
    pub fn report(&self, pool: ConnectionPoolStats) -> PerformanceReport {
        let inner = self.lock();
        let entries: Vec<&QueryStat> = inner.entries.iter().map(|(_, stat)| stat).collect();
        if entries.is_empty() {
            return PerformanceReport {
                pool,
                ..PerformanceReport::default()
            };
        }

        let mut total = Duration::ZERO;
        let mut min = Duration::MAX;
        let mut max = Duration::ZERO;
        let mut per_kind: BTreeMap<QueryKind, (usize, Duration, usize)> = BTreeMap::new();

        for stat in &entries {
            total += stat.duration;
            min = min.min(stat.duration);
            max = max.max(stat.duration);
            let slot = per_kind.entry(stat.kind).or_default();
            slot.0 += 1;
            slot.1 += stat.duration;
            if stat.error.is_some() {
                slot.2 += 1;
            }
        }

        let recent_errors = entries
            .iter()
            .rev()
            .filter_map(|stat| {
                stat.error.as_ref().map(|error| RecentError {
                    kind: stat.kind,
                    fingerprint: stat.fingerprint.clone(),
                    error: error.clone(),
                    timestamp: stat.timestamp,
                })
            })
            .take(RECENT_ERROR_LIMIT)
            .collect();

        let by_kind = per_kind
            .into_iter()
            .map(|(kind, (count, sum, errors))| {
                let stats = KindStats {
                    count,
                    avg_duration_ms: as_ms(sum) / count as f64,
                    errors,
                };
                (kind, stats)
            })
            .collect();

        PerformanceReport {
            total_queries: entries.len(),
            avg_duration_ms: as_ms(total) / entries.len() as f64,
            min_duration_ms: as_ms(min),
            max_duration_ms: as_ms(max),
            by_kind,
            pool,
            recent_errors,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(kind: QueryKind, millis: u64, error: Option<&str>) -> QueryStat {
        QueryStat {
            kind,
            duration: Duration::from_millis(millis),
            rows_affected: 1,
            timestamp: millis as i64,
            fingerprint: statement_fingerprint("SELECT 1"),
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = StatsRing::new(3);
        for ms in 1..=5 {
            ring.record(stat(QueryKind::Select, ms, None));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].duration, Duration::from_millis(3));
        assert_eq!(snapshot[2].duration, Duration::from_millis(5));
    }

    #[test]
    fn test_report_aggregates_by_kind() {
        let ring = StatsRing::new(100);
        ring.record(stat(QueryKind::Select, 10, None));
        ring.record(stat(QueryKind::Select, 30, None));
        ring.record(stat(QueryKind::Insert, 20, Some("UNIQUE constraint failed")));

        let report = ring.report(ConnectionPoolStats::default());
        assert_eq!(report.total_queries, 3);
        assert!((report.avg_duration_ms - 20.0).abs() < 1e-6);
        assert!((report.min_duration_ms - 10.0).abs() < 1e-6);
        assert!((report.max_duration_ms - 30.0).abs() < 1e-6);

        let select = &report.by_kind[&QueryKind::Select];
        assert_eq!(select.count, 2);
        assert!((select.avg_duration_ms - 20.0).abs() < 1e-6);
        assert_eq!(select.errors, 0);
        assert_eq!(report.by_kind[&QueryKind::Insert].errors, 1);

        assert_eq!(report.recent_errors.len(), 1);
        assert_eq!(report.recent_errors[0].kind, QueryKind::Insert);
    }

    #[test]
    fn test_empty_report() {
        let ring = StatsRing::new(10);
        let report = ring.report(ConnectionPoolStats::default());
        assert_eq!(report.total_queries, 0);
        assert!(report.by_kind.is_empty());
    }

    #[test]
    fn test_recent_errors_newest_first_and_capped() {
        let ring = StatsRing::new(100);
        for i in 0..15 {
            ring.record(stat(QueryKind::Update, i, Some(&format!("err {i}"))));
        }
        let report = ring.report(ConnectionPoolStats::default());
        assert_eq!(report.recent_errors.len(), RECENT_ERROR_LIMIT);
        assert_eq!(report.recent_errors[0].error, "err 14");
    }

    #[test]
    fn test_since_returns_unseen_stats() {
        let ring = StatsRing::new(3);
        ring.record(stat(QueryKind::Select, 1, None));
        ring.record(stat(QueryKind::Select, 2, None));
        let (first, next) = ring.since(0);
        assert_eq!(first.len(), 2);
        assert_eq!(next, 2);

        for ms in 3..=5 {
            ring.record(stat(QueryKind::Select, ms, None));
        }
        let (second, next) = ring.since(next);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].duration, Duration::from_millis(3));
        assert_eq!(next, 5);
    }

    #[test]
    fn test_fingerprint_ignores_whitespace() {
        assert_eq!(
            statement_fingerprint("SELECT  *\n FROM t"),
            statement_fingerprint("SELECT * FROM t")
        );
        assert_ne!(statement_fingerprint("SELECT 1"), statement_fingerprint("SELECT 2"));
        assert_eq!(statement_fingerprint("SELECT 1").len(), 16);
    }
}
