//! SQLite persistence.
//!
//! One connection behind an async mutex; repositories are stateless and take
//! `&Connection`, so every operation can also run inside a caller-owned
//! transaction. Raw SQL with rusqlite, no ORM.

pub mod accounts;
pub mod automation_runs;
pub mod bot_records;
pub mod events;
pub mod init;
pub mod links;
pub mod meetings;
pub mod transcripts;

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

pub use accounts::{Account, AccountRepository};
pub use automation_runs::{AutomationRun, AutomationRunRepository, RunStatus};
pub use bot_records::BotRecordRepository;
pub use events::{CalendarEvent, CalendarEventRepository, EventUpsert};
pub use init::{migrate, open_connection};
pub use links::{LinkOrigin, MeetingBotLink, MeetingBotLinkRepository};
pub use meetings::{Meeting, MeetingFilter, MeetingRepository, NewMeeting};
pub use transcripts::{TranscriptRecord, TranscriptRepository};

/// Shared handle to the meeting record store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_connection(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrate(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// `BEGIN IMMEDIATE` takes the write lock up front, so a concurrent writer
/// on the same file waits (up to the busy timeout) instead of racing.
pub fn begin_immediate(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .context("Failed to begin transaction")
}

pub fn commit(conn: &Connection) -> Result<()> {
    conn.execute_batch("COMMIT")
        .context("Failed to commit transaction")
}

pub fn rollback(conn: &Connection) -> Result<()> {
    conn.execute_batch("ROLLBACK")
        .context("Failed to roll back transaction")
}

/// True when `err` was caused by a UNIQUE or PRIMARY KEY constraint.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    })
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL orders them chronologically.
pub fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn time_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(idx, &raw)
}

pub(crate) fn opt_time_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_db_time(idx, &raw)).transpose()
}

fn parse_db_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Map a text column through a fallible parser.
pub(crate) fn parsed_column<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}
