//! Span schema migrations.
//!
//! Each step is compiled in and recorded in `_reef_migrations` once it has
//! run, inside the same transaction as its SQL.

use std::collections::HashSet;

use rusqlite::Connection;
use thiserror::Error;

const LEDGER: &str = "CREATE TABLE IF NOT EXISTS _reef_migrations (
    name       TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// One schema step.
#[derive(Debug, Clone, Copy)]
struct Step {
    name: &'static str,
    sql: &'static str,
}

/// Ordered schema history; append only.
const STEPS: &[Step] = &[
    Step {
        name: "000_traces",
        sql: include_str!("migrations/000_traces.sql"),
    },
    Step {
        name: "001_span_indexes",
        sql: include_str!("migrations/001_span_indexes.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{step}' failed: {source}")]
    Step {
        step: &'static str,
        source: rusqlite::Error,
    },

    #[error("failed to read migration ledger: {0}")]
    Ledger(#[source] rusqlite::Error),
}

/// Brings the span schema up to date and returns the names of the steps
/// that ran, oldest first. An up-to-date database yields an empty list.
///
/// # Errors
///
/// `Ledger` when `_reef_migrations` cannot be created or read, `Step` when
/// a step fails. A failed step leaves no trace of itself.
pub fn migrate(conn: &Connection) -> Result<Vec<&'static str>, MigrationError> {
    apply(conn, STEPS)
}

/// Names recorded in the ledger, in the order they were applied.
///
/// # Errors
///
/// Returns `Ledger` when the table cannot be read.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>, MigrationError> {
    conn.execute_batch(LEDGER).map_err(MigrationError::Ledger)?;
    let mut stmt = conn
        .prepare("SELECT name FROM _reef_migrations ORDER BY rowid")
        .map_err(MigrationError::Ledger)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(MigrationError::Ledger)?;
    Ok(names)
}

fn apply(conn: &Connection, steps: &[Step]) -> Result<Vec<&'static str>, MigrationError> {
    let done: HashSet<String> = applied_migrations(conn)?.into_iter().collect();
    let mut ran = Vec::new();

    for step in steps.iter().filter(|s| !done.contains(s.name)) {
        let fail = |source| MigrationError::Step {
            step: step.name,
            source,
        };
        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(step.sql).map_err(fail)?;
        tx.execute("INSERT INTO _reef_migrations (name) VALUES (?1)", [step.name])
            .map_err(fail)?;
        tx.commit().map_err(fail)?;

        tracing::info!(migration = step.name, "schema migration applied");
        ran.push(step.name);
    }

    if ran.is_empty() {
        tracing::debug!("span schema up to date");
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_table(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    fn fresh() -> Connection {
        Connection::open_in_memory().expect("should open in-memory db")
    }

    #[test]
    fn fresh_database_gets_every_step() {
        let conn = fresh();
        let ran = migrate(&conn).expect("migrations should succeed");
        assert_eq!(ran, vec!["000_traces", "001_span_indexes"]);
        assert!(has_table(&conn, "traces"));
        assert!(has_table(&conn, "spans"));

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_spans_%'",
                [],
                |row| row.get(0),
            )
            .expect("should count indexes");
        assert_eq!(indexes, 4);
        assert_eq!(
            applied_migrations(&conn).expect("should read ledger"),
            vec!["000_traces", "001_span_indexes"]
        );
    }

    #[test]
    fn second_run_is_empty() {
        let conn = fresh();
        migrate(&conn).expect("first run should succeed");
        assert!(migrate(&conn).expect("second run should succeed").is_empty());
    }

    #[test]
    fn only_missing_steps_run() {
        let conn = fresh();
        apply(&conn, &STEPS[..1]).expect("first step should apply");
        assert_eq!(
            migrate(&conn).expect("catch-up should succeed"),
            vec!["001_span_indexes"]
        );
    }

    #[test]
    fn broken_step_leaves_nothing_behind() {
        let conn = fresh();
        let steps = [Step {
            name: "900_broken",
            sql: "CREATE TABLE half_done (id INTEGER PRIMARY KEY);
                  INSERT INTO no_such_table VALUES (1);",
        }];

        match apply(&conn, &steps) {
            Err(MigrationError::Step { step, .. }) => assert_eq!(step, "900_broken"),
            other => panic!("expected a step failure, got {other:?}"),
        }
        assert!(!has_table(&conn, "half_done"));
        assert!(applied_migrations(&conn)
            .expect("should read ledger")
            .is_empty());
    }
}
