//! SQLite-backed local store: the authority for transactions, the user
//! profile and the session key/value blob.
//!
//! Every write the pipeline depends on lands here first. The remote ledger is
//! a mirror; a failed write in this module is fatal to the current event.

pub mod profile;
pub mod session;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::extract::ExtractedTransaction;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app       TEXT    NOT NULL,
    amount           REAL    NOT NULL,
    raw_message      TEXT    NOT NULL,
    timestamp_ms     INTEGER NOT NULL,
    is_trial_limited INTEGER NOT NULL DEFAULT 0,
    dedup_key        TEXT    UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_transactions_ts ON transactions(timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_transactions_locked ON transactions(is_trial_limited, timestamp_ms);

CREATE TABLE IF NOT EXISTS user_profile (
    uid          TEXT PRIMARY KEY,
    email        TEXT    NOT NULL,
    store_name   TEXT    NOT NULL,
    phone_number TEXT    NOT NULL DEFAULT '',
    category     TEXT    NOT NULL DEFAULT '',
    joined_at_ms INTEGER NOT NULL,
    is_synced    INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS session (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable form of an [`ExtractedTransaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: RecordId,
    pub source_app: String,
    pub amount: f64,
    pub raw_message: String,
    pub timestamp: DateTime<Utc>,
    pub is_trial_limited: bool,
    pub dedup_key: Option<String>,
}

/// Result of a local insert. A matching dedup key keeps the first row as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New(RecordId),
    Existing(RecordId),
}

impl Inserted {
    pub fn id(self) -> RecordId {
        match self {
            Inserted::New(id) | Inserted::Existing(id) => id,
        }
    }
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) a file-backed store and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // --- transactions ---

    /// Insert one extracted transaction. With a dedup key, a repeated delivery
    /// returns the existing row instead of writing a second one.
    pub fn insert_transaction(
        &self,
        tx: &ExtractedTransaction,
        dedup_key: Option<&str>,
    ) -> Result<Inserted, StoreError> {
        let conn = self.conn()?;
        if let Some(key) = dedup_key {
            let existing = conn
                .query_row(
                    "SELECT id FROM transactions WHERE dedup_key = ?1",
                    params![key],
                    |r| r.get::<_, i64>(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(Inserted::Existing(RecordId(id)));
            }
        }
        conn.execute(
            "INSERT INTO transactions
                (source_app, amount, raw_message, timestamp_ms, is_trial_limited, dedup_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tx.source_app,
                tx.amount,
                tx.raw_message,
                tx.timestamp.timestamp_millis(),
                tx.is_trial_limited,
                dedup_key,
            ],
        )?;
        Ok(Inserted::New(RecordId(conn.last_insert_rowid())))
    }

    /// Bulk insert from a remote history pull. A row already present with the
    /// same (source, timestamp, amount) is skipped. Returns rows written.
    pub fn insert_history(&self, rows: &[ExtractedTransaction]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let db_tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = db_tx.prepare(
                "INSERT INTO transactions
                    (source_app, amount, raw_message, timestamp_ms, is_trial_limited)
                 SELECT ?1, ?2, ?3, ?4, ?5
                 WHERE NOT EXISTS (
                    SELECT 1 FROM transactions
                    WHERE source_app = ?1 AND amount = ?2 AND timestamp_ms = ?4
                 )",
            )?;
            for row in rows {
                written += stmt.execute(params![
                    row.source_app,
                    row.amount,
                    row.raw_message,
                    row.timestamp.timestamp_millis(),
                    row.is_trial_limited,
                ])?;
            }
        }
        db_tx.commit()?;
        Ok(written)
    }

    /// Clear `is_trial_limited` on every row. Returns rows changed.
    pub fn unlock_all(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE transactions SET is_trial_limited = 0 WHERE is_trial_limited = 1",
            [],
        )?)
    }

    /// Delete locked rows strictly older than `cutoff`. Unlocked rows are never touched.
    pub fn sweep_locked_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM transactions WHERE is_trial_limited = 1 AND timestamp_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?)
    }

    /// Rows with `start <= timestamp <= end`, newest first.
    pub fn transactions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        self.query_between_ms(start.timestamp_millis(), end.timestamp_millis())
    }

    pub fn all_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        self.query_between_ms(i64::MIN, i64::MAX)
    }

    fn query_between_ms(&self, start_ms: i64, end_ms: i64) -> Result<Vec<TransactionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_app, amount, raw_message, timestamp_ms, is_trial_limited, dedup_key
             FROM transactions
             WHERE timestamp_ms BETWEEN ?1 AND ?2
             ORDER BY timestamp_ms DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![start_ms, end_ms], map_transaction_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn total_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<f64, StoreError> {
        let conn = self.conn()?;
        let total: Option<f64> = conn.query_row(
            "SELECT SUM(amount) FROM transactions WHERE timestamp_ms BETWEEN ?1 AND ?2",
            params![start.timestamp_millis(), end.timestamp_millis()],
            |r| r.get(0),
        )?;
        Ok(total.unwrap_or(0.0))
    }

    pub fn delete_transaction(&self, id: RecordId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM transactions WHERE id = ?1", params![id.0])? > 0)
    }
}

fn map_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let ts_ms: i64 = row.get(4)?;
    Ok(TransactionRecord {
        id: RecordId(row.get(0)?),
        source_app: row.get(1)?,
        amount: row.get(2)?,
        raw_message: row.get(3)?,
        timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or_default(),
        is_trial_limited: row.get(5)?,
        dedup_key: row.get(6)?,
    })
}
