//! SQLite-backed download history.
//!
//! The history store is the source of truth for "which periods are
//! already satisfied". Dedup rides on SQLite uniqueness: committing is a
//! single `INSERT OR IGNORE`, and an ignored insert surfaces as
//! [`CommitOutcome::Conflict`] so a concurrent run losing the race can
//! treat the period as satisfied instead of failing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex; // Faster than std::sync::Mutex
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{DownloadRecord, ReportPeriod};

const SCHEMA_SQL: &str = r#"
-- WAL so API reads don't block a reconciliation pass mid-commit
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cf1400_files (
    id INTEGER PRIMARY KEY,
    year INTEGER NOT NULL,
    quarter INTEGER NOT NULL,
    month INTEGER NOT NULL,
    pdf_filename TEXT NOT NULL UNIQUE,
    file_url TEXT NOT NULL,
    pattern_id TEXT NOT NULL,
    downloaded_at TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0
);

-- One report per period, even if the configured report name changes
CREATE UNIQUE INDEX IF NOT EXISTS idx_cf1400_files_period
    ON cf1400_files(year, month);

CREATE INDEX IF NOT EXISTS idx_cf1400_files_unprocessed
    ON cf1400_files(processed) WHERE processed = 0;

-- Rows extracted from the PDFs by the downstream conversion step
CREATE TABLE IF NOT EXISTS vessel_entrances (
    id INTEGER PRIMARY KEY,
    cf1400_file_id INTEGER NOT NULL REFERENCES cf1400_files(id),
    port_code TEXT,
    vessel_name TEXT,
    entrance_date TEXT,
    detail_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_vessel_entrances_file
    ON vessel_entrances(cf1400_file_id);
"#;

/// Result of committing a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Record inserted; this run owns the download.
    Committed,
    /// The period/filename was already recorded. A concurrent run won
    /// the race; not an error.
    Conflict,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_files: usize,
    pub unprocessed_files: usize,
    pub latest_period: Option<ReportPeriod>,
}

/// What the reconciliation engine needs from persistence. Backed by
/// SQLite in production; tests substitute scripted implementations.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Most recent period with a committed record, if any.
    async fn latest_known_period(&self) -> Result<Option<ReportPeriod>>;

    /// Pattern id of the most recent successful download, used to probe
    /// the publisher's current layout first.
    async fn latest_successful_pattern(&self) -> Result<Option<String>>;

    /// Whether a record with this canonical filename exists.
    async fn exists(&self, filename: &str) -> Result<bool>;

    /// Record a completed download. The file must already be on disk.
    async fn commit(&self, record: &DownloadRecord) -> Result<CommitOutcome>;

    /// Most recent records, newest period first.
    async fn recent(&self, limit: usize) -> Result<Vec<DownloadRecord>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Flag a record as converted downstream. Returns false when the
    /// filename is unknown.
    async fn mark_processed(&self, filename: &str) -> Result<bool>;
}

pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        // Verify WAL mode is active (":memory:" reports "memory")
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !matches!(journal_mode.to_lowercase().as_str(), "wal" | "memory") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cf1400_files", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Download history initialized at: {}", db_path);
        info!("📈 Reports already recorded: {}", count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn latest_period(conn: &Connection) -> Result<Option<ReportPeriod>> {
        let mut stmt = conn.prepare_cached(
            "SELECT year, quarter, month FROM cf1400_files
             ORDER BY year DESC, month DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let year: i32 = row.get(0)?;
                let quarter: u8 = row.get(1)?;
                let month: u8 = row.get(2)?;
                let period = ReportPeriod::new(year, quarter, month)
                    .context("corrupt period row in cf1400_files")?;
                Ok(Some(period))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn latest_known_period(&self) -> Result<Option<ReportPeriod>> {
        let conn = self.conn.lock();
        Self::latest_period(&conn)
    }

    async fn latest_successful_pattern(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT pattern_id FROM cf1400_files
             ORDER BY year DESC, month DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn exists(&self, filename: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM cf1400_files WHERE pdf_filename = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![filename])?;
        Ok(rows.next()?.is_some())
    }

    async fn commit(&self, record: &DownloadRecord) -> Result<CommitOutcome> {
        let downloaded_at = record.downloaded_at.to_rfc3339();
        let conn = self.conn.lock();

        // INSERT OR IGNORE + changed-rows check turns both uniqueness
        // constraints into a race verdict instead of an error
        let changes = conn.execute(
            "INSERT OR IGNORE INTO cf1400_files
             (year, quarter, month, pdf_filename, file_url, pattern_id, downloaded_at, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.period.year(),
                record.period.quarter(),
                record.period.month(),
                &record.filename,
                &record.source_url,
                &record.pattern_id,
                downloaded_at,
                record.processed as i64,
            ],
        )?;

        if changes > 0 {
            debug!("recorded {} for {}", record.filename, record.period);
            Ok(CommitOutcome::Committed)
        } else {
            Ok(CommitOutcome::Conflict)
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, year, quarter, month, pdf_filename, file_url, pattern_id,
                    downloaded_at, processed
             FROM cf1400_files
             ORDER BY year DESC, month DESC, id DESC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map(params![limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let total_files: i64 =
            conn.query_row("SELECT COUNT(*) FROM cf1400_files", [], |row| row.get(0))?;
        let unprocessed_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cf1400_files WHERE processed = 0",
            [],
            |row| row.get(0),
        )?;
        let latest_period = Self::latest_period(&conn)?;
        Ok(StoreStats {
            total_files: total_files as usize,
            unprocessed_files: unprocessed_files as usize,
            latest_period,
        })
    }

    async fn mark_processed(&self, filename: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "UPDATE cf1400_files SET processed = 1 WHERE pdf_filename = ?1",
            params![filename],
        )?;
        Ok(changes > 0)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DownloadRecord> {
    let year: i32 = row.get(1)?;
    let quarter: u8 = row.get(2)?;
    let month: u8 = row.get(3)?;
    let period = ReportPeriod::new(year, quarter, month)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Integer, e.into()))?;

    let downloaded_at: String = row.get(7)?;
    let downloaded_at = DateTime::parse_from_rfc3339(&downloaded_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(DownloadRecord {
        id: Some(row.get(0)?),
        period,
        filename: row.get(4)?,
        source_url: row.get(5)?,
        pattern_id: row.get(6)?,
        downloaded_at,
        processed: row.get::<_, i64>(8)? != 0,
    })
}
