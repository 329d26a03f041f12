//! SQLite result store.
//!
//! One row per item identifier; the unique `id` column makes a second record for
//! the same identifier impossible. WAL mode so `evalq status` can read while
//! a run is writing. Each append is a single INSERT, which SQLite commits
//! atomically.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{ItemId, ResultRecord};

use super::ResultStore;

/// Storage backend. Owns the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS results (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                id           TEXT NOT NULL UNIQUE,
                run_id       TEXT NOT NULL,
                status       TEXT NOT NULL,
                record       TEXT NOT NULL,
                recorded_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_run ON results(run_id);
            CREATE INDEX IF NOT EXISTS idx_results_status ON results(status);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }
}

impl ResultStore for SqliteStore {
    fn existing_identifiers(&self) -> Result<HashSet<ItemId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM results")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|id| id.map(ItemId))
                .collect::<std::result::Result<HashSet<_>, _>>()?;
            Ok(ids)
        })
    }

    fn append(&self, record: &ResultRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let status = if record.outcome.is_success() {
            "success"
        } else {
            "failure"
        };

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO results (id, run_id, status, record, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.as_str(),
                    record.run_id.0.to_string(),
                    status,
                    json,
                    timestamp(record.recorded_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::DuplicateResult(record.id.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn records(&self) -> Result<Vec<ResultRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT record FROM results ORDER BY seq ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            parse_records(rows)
        })
    }
}

/// Fixed-width so stored timestamps compare correctly as text.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_records(rows: Vec<String>) -> Result<Vec<ResultRecord>> {
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(Error::from))
        .collect()
}
