//! SQLite persistence for finished spans.
//!
//! Writes go through [`TraceStore::insert`], which takes the store's write
//! lock and records the trace row and the span row in one transaction.
//! Reads use pooled connections without the lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use reef_db::{migrate, open_pool, DbLocation, DbPool, PoolSettings};
use rusqlite::params;
use serde::Serialize;

use crate::error::TraceError;
use crate::span::{now_ns, SpanKind, SpanRecord, SpanStatus};

const DEFAULT_FIND_LIMIT: i64 = 100;
const NANOS_PER_DAY: i64 = 86_400 * 1_000_000_000;

/// Filter criteria for [`TraceStore::find_spans`].
#[derive(Debug, Clone, Default)]
pub struct SpanFilter {
    /// Exact span name, e.g. `agent.researcher.execute`.
    pub name: Option<String>,
    /// Value of the `agent.name` attribute.
    pub agent: Option<String>,
    /// Span status.
    pub status: Option<SpanStatus>,
    /// Only spans lasting at least this long.
    pub min_duration_ms: Option<f64>,
    /// Maximum number of spans to return (default: 100).
    pub limit: Option<i64>,
}

/// One row of [`TraceStore::recent_traces`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub trace_id: String,
    /// Start of the earliest span, Unix nanoseconds.
    pub started_ns: i64,
    /// Start of the latest span, Unix nanoseconds.
    pub last_span_ns: i64,
    pub span_count: u64,
    pub error_count: u64,
}

/// Aggregate figures over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceStats {
    pub trace_count: u64,
    pub span_count: u64,
    pub error_count: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
    pub spans_by_kind: BTreeMap<String, u64>,
}

/// A thread-safe handle to the span database.
#[derive(Clone)]
pub struct TraceStore {
    pool: DbPool,
    write_lock: Arc<Mutex<()>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Expands a leading `~` to the home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

impl TraceStore {
    /// Opens (or creates) the store at a configured path, expanding `~` and
    /// creating missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns `TraceError` when the directory, the pool or the schema cannot
    /// be created.
    pub fn open(path: &str) -> Result<Self, TraceError> {
        let path = expand_path(path);
        let pool = open_pool(&DbLocation::file(&path), PoolSettings::default())?;
        Self::from_pool(pool, Some(path))
    }

    /// A private in-memory store, used by tests and short-lived tools.
    ///
    /// # Errors
    ///
    /// Returns `TraceError` when the pool or schema cannot be created.
    pub fn in_memory() -> Result<Self, TraceError> {
        let pool = open_pool(&DbLocation::Memory, PoolSettings::default())?;
        Self::from_pool(pool, None)
    }

    fn from_pool(pool: DbPool, path: Option<PathBuf>) -> Result<Self, TraceError> {
        {
            let conn = pool.get()?;
            migrate(&conn)?;
        }
        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            path,
        })
    }

    /// The backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persists one finished span. Re-inserting a span id overwrites it.
    ///
    /// # Errors
    ///
    /// Returns `TraceError` on SQL or serialization failure.
    pub fn insert(&self, span: &SpanRecord) -> Result<(), TraceError> {
        let attributes_json = serde_json::to_string(&span.attributes)?;
        let events_json = serde_json::to_string(&span.events)?;

        // Poisoning leaves no partial write behind: the transaction rolled back.
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO traces (trace_id, first_seen) VALUES (?1, ?2)",
            params![span.trace_id, span.start_ns],
        )?;
        tx.execute(
            "UPDATE traces SET first_seen = ?2 WHERE trace_id = ?1 AND first_seen > ?2",
            params![span.trace_id, span.start_ns],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO spans
                (span_id, trace_id, parent_span_id, name, kind, start_ns, end_ns,
                 duration_ms, status, attributes_json, events_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                span.span_id,
                span.trace_id,
                span.parent_span_id,
                span.name,
                span.kind.as_str(),
                span.start_ns,
                span.end_ns,
                span.duration_ms,
                span.status.as_str(),
                attributes_json,
                events_json,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All spans of one trace, oldest first. Unknown ids yield an empty list.
    ///
    /// # Errors
    ///
    /// Returns `TraceError` on SQL or deserialization failure.
    pub fn get_trace(&self, trace_id: &str) -> Result<Vec<SpanRecord>, TraceError> {
        self.select_spans("WHERE trace_id = ?1 ORDER BY start_ns ASC", &[&trace_id as &dyn rusqlite::types::ToSql])
    }

    /// The most recently active traces, newest first.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Database` on SQL failure.
    pub fn recent_traces(&self, limit: i64) -> Result<Vec<TraceSummary>, TraceError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT trace_id, MIN(start_ns), MAX(start_ns), COUNT(*),
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END)
             FROM spans
             GROUP BY trace_id
             ORDER BY MAX(start_ns) DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(TraceSummary {
                trace_id: row.get(0)?,
                started_ns: row.get(1)?,
                last_span_ns: row.get(2)?,
                span_count: row.get::<_, i64>(3)?.max(0) as u64,
                error_count: row.get::<_, i64>(4)?.max(0) as u64,
            })
        })?;

        let mut traces = Vec::new();
        for row in rows {
            traces.push(row?);
        }
        Ok(traces)
    }

    /// Spans matching every set field of `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `TraceError` on SQL or deserialization failure.
    pub fn find_spans(&self, filter: &SpanFilter) -> Result<Vec<SpanRecord>, TraceError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut idx = 1u32;

        if let Some(ref name) = filter.name {
            clauses.push(format!("name = ?{idx}"));
            param_values.push(Box::new(name.clone()));
            idx += 1;
        }

        if let Some(ref agent) = filter.agent {
            clauses.push(format!(
                "json_extract(attributes_json, '$.\"agent.name\"') = ?{idx}"
            ));
            param_values.push(Box::new(agent.clone()));
            idx += 1;
        }

        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{idx}"));
            param_values.push(Box::new(status.as_str()));
            idx += 1;
        }

        if let Some(min) = filter.min_duration_ms {
            clauses.push(format!("duration_ms >= ?{idx}"));
            param_values.push(Box::new(min));
            idx += 1;
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        param_values.push(Box::new(filter.limit.unwrap_or(DEFAULT_FIND_LIMIT)));

        let tail = format!("{where_clause} ORDER BY start_ns DESC LIMIT ?{idx}");
        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| &**p).collect();
        self.select_spans(&tail, &params_refs)
    }

    /// Total number of stored spans.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Database` on SQL failure.
    pub fn span_count(&self) -> Result<u64, TraceError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM spans", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Aggregate statistics.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Database` on SQL failure.
    pub fn stats(&self) -> Result<TraceStats, TraceError> {
        let conn = self.pool.get()?;
        let (span_count, error_count, avg, max): (i64, i64, Option<f64>, Option<f64>) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                        AVG(duration_ms),
                        MAX(duration_ms)
                 FROM spans",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        let trace_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))?;

        let mut spans_by_kind = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM spans GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            spans_by_kind.insert(kind, count.max(0) as u64);
        }

        Ok(TraceStats {
            trace_count: trace_count.max(0) as u64,
            span_count: span_count.max(0) as u64,
            error_count: error_count.max(0) as u64,
            avg_duration_ms: avg.unwrap_or(0.0),
            max_duration_ms: max.unwrap_or(0.0),
            spans_by_kind,
        })
    }

    /// Deletes spans that started more than `days` days ago, then trace rows
    /// with no spans left. Returns the number of spans deleted.
    ///
    /// # Errors
    ///
    /// Returns `TraceError::Database` on SQL failure.
    pub fn cleanup_old_traces(&self, days: u32) -> Result<usize, TraceError> {
        let cutoff = now_ns().saturating_sub(NANOS_PER_DAY.saturating_mul(i64::from(days)));

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let deleted = tx.execute("DELETE FROM spans WHERE start_ns < ?1", params![cutoff])?;
        let orphans = tx.execute(
            "DELETE FROM traces WHERE trace_id NOT IN (SELECT DISTINCT trace_id FROM spans)",
            [],
        )?;
        tx.commit()?;

        tracing::info!(
            spans = deleted,
            traces = orphans,
            days,
            "removed old traces"
        );
        Ok(deleted)
    }

    fn select_spans(
        &self,
        tail: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<SpanRecord>, TraceError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT span_id, trace_id, parent_span_id, name, kind, start_ns, end_ns,
                    duration_ms, status, attributes_json, events_json
             FROM spans {tail}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(SpanRow {
                span_id: row.get(0)?,
                trace_id: row.get(1)?,
                parent_span_id: row.get(2)?,
                name: row.get(3)?,
                kind: row.get(4)?,
                start_ns: row.get(5)?,
                end_ns: row.get(6)?,
                duration_ms: row.get(7)?,
                status: row.get(8)?,
                attributes_json: row.get(9)?,
                events_json: row.get(10)?,
            })
        })?;

        let mut spans = Vec::new();
        for row in rows {
            spans.push(row?.into_record()?);
        }
        Ok(spans)
    }
}

struct SpanRow {
    span_id: String,
    trace_id: String,
    parent_span_id: Option<String>,
    name: String,
    kind: String,
    start_ns: i64,
    end_ns: i64,
    duration_ms: f64,
    status: String,
    attributes_json: String,
    events_json: String,
}

impl SpanRow {
    fn into_record(self) -> Result<SpanRecord, TraceError> {
        Ok(SpanRecord {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            name: self.name,
            kind: self.kind.parse().unwrap_or(SpanKind::Internal),
            start_ns: self.start_ns,
            end_ns: self.end_ns,
            duration_ms: self.duration_ms,
            status: self.status.parse().unwrap_or(SpanStatus::Unset),
            attributes: serde_json::from_str(&self.attributes_json)?,
            events: serde_json::from_str(&self.events_json)?,
        })
    }
}
