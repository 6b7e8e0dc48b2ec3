//! Append-only SQLite log of readings.
//!
//! Layout (one table, created idempotently):
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS sensor_readings (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     temperature REAL,
//!     humidity REAL,
//!     co2 INTEGER,
//!     timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
//! )
//! ```
//!
//! The database runs in WAL mode with `synchronous = FULL`, so every
//! autocommitted insert is durable before [`StoreWriter::append`] returns and
//! readers never observe a partially written row. `AUTOINCREMENT` keeps ids
//! strictly increasing and never reused across restarts.
//!
//! Reads and writes use separate connections. [`Store`] owns the read side and
//! can be shared freely; the write side is a [`StoreWriter`] that can be
//! claimed by at most one owner at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::NaiveDateTime;
use log::debug;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::reading::{Reading, StoredReading};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS sensor_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    temperature REAL,
    humidity REAL,
    co2 INTEGER,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
)";

const SELECT_COLUMNS: &str = "SELECT id, temperature, humidity, co2, timestamp FROM sensor_readings";

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Timestamp format written for producer-supplied times (matches `CURRENT_TIMESTAMP`).
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The schema has not been created yet.
    #[error("store schema has not been created")]
    NotInitialized,

    #[error("store I/O failure: {0}")]
    Io(#[from] rusqlite::Error),

    /// A second writer was requested while one is still alive.
    #[error("store already has an active writer")]
    WriterClaimed,

    #[error("unparseable timestamp {0:?}")]
    InvalidTimestamp(String),
}

struct Shared {
    path: PathBuf,
    initialized: AtomicBool,
    writer_claimed: AtomicBool,
}

/// Read side of the reading log.
pub struct Store {
    shared: Arc<Shared>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file at `path`.
    ///
    /// An existing `sensor_readings` table is detected, so reopening a store
    /// after a restart does not need another [`create_schema`](Self::create_schema).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path)?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sensor_readings')",
            [],
            |row| row.get(0),
        )?;
        debug!("Opened store {} (schema present: {exists})", path.display());

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                initialized: AtomicBool::new(exists),
                writer_claimed: AtomicBool::new(false),
            }),
            reader: Mutex::new(conn),
        })
    }

    /// Open the store and make sure the schema exists.
    pub fn open_initialized(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self::open(path)?;
        store.create_schema()?;
        Ok(store)
    }

    /// Create the table if absent. Safe to call any number of times.
    pub fn create_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(CREATE_TABLE)?;
        self.shared.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Claim the single write handle.
    pub fn writer(&self) -> Result<StoreWriter, StoreError> {
        self.ensure_initialized()?;
        if self
            .shared
            .writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::WriterClaimed);
        }
        match open_connection(&self.shared.path) {
            Ok(conn) => Ok(StoreWriter {
                shared: Arc::clone(&self.shared),
                conn: Some(conn),
            }),
            Err(e) => {
                self.shared.writer_claimed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// The highest-id row, if any.
    pub fn latest(&self) -> Result<Option<StoredReading>, StoreError> {
        self.ensure_initialized()?;
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT 1"),
                [],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_stored).transpose()
    }

    /// Up to `limit` rows, most recent first.
    pub fn history(&self, limit: usize) -> Result<Vec<StoredReading>, StoreError> {
        self.ensure_initialized()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit], RawRow::from_row)?;

        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_stored()?);
        }
        Ok(out)
    }

    /// The most recent `limit` rows in insertion order (oldest first).
    pub fn recent_oldest_first(&self, limit: usize) -> Result<Vec<StoredReading>, StoreError> {
        let mut rows = self.history(limit)?;
        rows.reverse();
        Ok(rows)
    }

    /// Total number of stored rows.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.ensure_initialized()?;
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive write handle. Dropping it releases the claim.
pub struct StoreWriter {
    shared: Arc<Shared>,
    conn: Option<Connection>,
}

impl StoreWriter {
    /// Insert one reading, stamping `timestamp` in SQLite when the reading
    /// carries none. Returns the committed row.
    pub fn append(&mut self, reading: &Reading) -> Result<StoredReading, StoreError> {
        if !self.shared.initialized.load(Ordering::Acquire) {
            return Err(StoreError::NotInitialized);
        }
        let conn = self
            .conn
            .as_ref()
            .ok_or(StoreError::NotInitialized)?;

        let (id, raw_ts): (i64, String) = match reading.observed_at {
            None => conn.query_row(
                "INSERT INTO sensor_readings (temperature, humidity, co2)
                 VALUES (?1, ?2, ?3) RETURNING id, timestamp",
                params![reading.temperature, reading.humidity, reading.co2],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?,
            Some(ts) => conn.query_row(
                "INSERT INTO sensor_readings (temperature, humidity, co2, timestamp)
                 VALUES (?1, ?2, ?3, ?4) RETURNING id, timestamp",
                params![
                    reading.temperature,
                    reading.humidity,
                    reading.co2,
                    ts.format(TIMESTAMP_FORMAT).to_string()
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?,
        };

        Ok(StoredReading {
            id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            co2: reading.co2,
            timestamp: parse_timestamp(&raw_ts)?,
        })
    }

    /// Close the write connection, surfacing any error from the final sync.
    pub fn close(mut self) -> Result<(), StoreError> {
        match self.conn.take() {
            Some(conn) => conn.close().map_err(|(_, e)| StoreError::Io(e)),
            None => Ok(()),
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.shared.writer_claimed.store(false, Ordering::Release);
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

/// Parse a timestamp column as written by `CURRENT_TIMESTAMP` or by us.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, StoreError> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| StoreError::InvalidTimestamp(raw.to_string()))
}

struct RawRow {
    id: i64,
    temperature: f64,
    humidity: f64,
    co2: i64,
    timestamp: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            temperature: row.get(1)?,
            humidity: row.get(2)?,
            co2: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }

    fn into_stored(self) -> Result<StoredReading, StoreError> {
        Ok(StoredReading {
            id: self.id,
            temperature: self.temperature,
            humidity: self.humidity,
            co2: self.co2,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}
