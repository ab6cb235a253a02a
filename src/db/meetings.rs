//! Meeting record persistence.
//!
//! CRUD operations for the `meetings` table. Status changes go through
//! `transition`, a compare-and-set on the current status, so two workers
//! observing the same bot cannot both apply a move.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{opt_time_column, parsed_column, time_column, to_db_time};
use crate::meeting::MeetingStatus;
use crate::urls::Platform;

/// A meeting record from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meeting {
    pub id: i64,
    pub account_id: String,
    pub calendar_event_id: String,
    pub bot_id: Option<String>,
    pub status: MeetingStatus,
    pub platform: Platform,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMeeting<'a> {
    pub account_id: &'a str,
    pub calendar_event_id: &'a str,
    pub bot_id: Option<&'a str>,
    pub status: MeetingStatus,
    pub platform: Platform,
}

/// Query options for listing meetings.
#[derive(Debug, Clone, Default)]
pub struct MeetingFilter {
    pub account_id: Option<String>,
    pub status: Option<MeetingStatus>,
    pub limit: Option<usize>,
}

const MEETING_COLUMNS: &str = "id, account_id, calendar_event_id, bot_id, status, platform, \
                               started_at, ended_at, error, created_at, updated_at";

fn map_meeting(row: &rusqlite::Row<'_>) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get(0)?,
        account_id: row.get(1)?,
        calendar_event_id: row.get(2)?,
        bot_id: row.get(3)?,
        status: parsed_column(row, 4, MeetingStatus::parse)?,
        platform: parsed_column(row, 5, |raw| Ok(Platform::parse(raw)))?,
        started_at: opt_time_column(row, 6)?,
        ended_at: opt_time_column(row, 7)?,
        error: row.get(8)?,
        created_at: time_column(row, 9)?,
        updated_at: time_column(row, 10)?,
    })
}

/// Repository for meeting records.
pub struct MeetingRepository;

impl MeetingRepository {
    /// Insert a new meeting record and return its id. Fails with a UNIQUE
    /// violation if the event already has a live meeting or the bot is
    /// already claimed.
    pub fn insert(conn: &Connection, meeting: &NewMeeting<'_>, now: DateTime<Utc>) -> Result<i64> {
        let now = to_db_time(now);
        conn.execute(
            "INSERT INTO meetings \
                (account_id, calendar_event_id, bot_id, status, platform, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                meeting.account_id,
                meeting.calendar_event_id,
                meeting.bot_id,
                meeting.status.as_str(),
                meeting.platform.as_str(),
                now,
            ],
        )
        .context("Failed to insert meeting")?;

        Ok(conn.last_insert_rowid())
    }

    /// Get a meeting by ID.
    pub fn get(conn: &Connection, id: i64) -> Result<Option<Meeting>> {
        conn.query_row(
            &format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE id = ?1"),
            params![id],
            map_meeting,
        )
        .optional()
        .context("Failed to query meeting")
    }

    /// The non-cancelled meeting for an (account, event) pair.
    pub fn find_active_for_event(
        conn: &Connection,
        account_id: &str,
        calendar_event_id: &str,
    ) -> Result<Option<Meeting>> {
        conn.query_row(
            &format!(
                "SELECT {MEETING_COLUMNS} FROM meetings \
                 WHERE account_id = ?1 AND calendar_event_id = ?2 AND status != 'cancelled'"
            ),
            params![account_id, calendar_event_id],
            map_meeting,
        )
        .optional()
        .context("Failed to query meeting for event")
    }

    pub fn find_by_bot(conn: &Connection, bot_id: &str) -> Result<Option<Meeting>> {
        conn.query_row(
            &format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE bot_id = ?1"),
            params![bot_id],
            map_meeting,
        )
        .optional()
        .context("Failed to query meeting by bot")
    }

    /// List meetings, newest first.
    pub fn list(conn: &Connection, filter: &MeetingFilter) -> Result<Vec<Meeting>> {
        let mut sql = format!("SELECT {MEETING_COLUMNS} FROM meetings WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(account_id) = &filter.account_id {
            sql.push_str(" AND account_id = ?");
            params.push(Box::new(account_id.clone()));
        }

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str()));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        params.push(Box::new(filter.limit.unwrap_or(100) as i64));

        let mut stmt = conn.prepare(&sql).context("Failed to prepare meetings list query")?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let meetings = stmt
            .query_map(param_refs.as_slice(), map_meeting)
            .context("Failed to list meetings")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map meetings")?;

        Ok(meetings)
    }

    /// Meetings in any of `statuses`, oldest first.
    pub fn list_by_status(conn: &Connection, statuses: &[MeetingStatus]) -> Result<Vec<Meeting>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {MEETING_COLUMNS} FROM meetings WHERE status IN ({placeholders}) \
             ORDER BY created_at, id"
        );
        let values: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();

        let mut stmt = conn.prepare(&sql).context("Failed to prepare status query")?;
        let meetings = stmt
            .query_map(rusqlite::params_from_iter(values), map_meeting)
            .context("Failed to query meetings by status")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map meetings")?;

        Ok(meetings)
    }

    /// Move a meeting from `from` to `to`. Returns false when the meeting is
    /// no longer in `from`.
    pub fn transition(
        conn: &Connection,
        id: i64,
        from: MeetingStatus,
        to: MeetingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.can_advance_to(to) {
            anyhow::bail!("Illegal meeting transition {} -> {}", from, to);
        }

        let changed = conn
            .execute(
                "UPDATE meetings SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), to_db_time(now), id, from.as_str()],
            )
            .context("Failed to update meeting status")?;

        Ok(changed > 0)
    }

    /// Mark meeting as failed with error, from whatever non-terminal state it
    /// is in.
    pub fn fail(conn: &Connection, id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE meetings SET status = ?1, error = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status IN ('scheduled', 'recording', 'processing')",
                params![MeetingStatus::Failed.as_str(), error, to_db_time(now), id],
            )
            .context("Failed to mark meeting as failed")?;
        Ok(changed > 0)
    }

    /// Record lifecycle times derived from the bot. Known values are never
    /// cleared.
    pub fn set_times(
        conn: &Connection,
        id: i64,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE meetings SET \
                started_at = COALESCE(?1, started_at), \
                ended_at = COALESCE(?2, ended_at) \
             WHERE id = ?3",
            params![started_at.map(to_db_time), ended_at.map(to_db_time), id],
        )
        .context("Failed to update meeting times")?;
        Ok(())
    }

    /// Attach a bot to a live meeting that has none. Returns false if the
    /// meeting already has a bot or was cancelled.
    pub fn attach_bot(conn: &Connection, id: i64, bot_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE meetings SET bot_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND bot_id IS NULL AND status != 'cancelled'",
                params![bot_id, to_db_time(now), id],
            )
            .context("Failed to attach bot to meeting")?;
        Ok(changed > 0)
    }

    /// Delete a bot-less `scheduled` meeting. Returns false when the meeting
    /// has since gained a bot, moved on, or is gone.
    pub fn release_reservation(conn: &Connection, id: i64) -> Result<bool> {
        let changed = conn
            .execute(
                "DELETE FROM meetings WHERE id = ?1 AND bot_id IS NULL AND status = 'scheduled'",
                params![id],
            )
            .context("Failed to release meeting reservation")?;
        Ok(changed > 0)
    }

    /// Delete bot-less `scheduled` meetings created before `cutoff`; they
    /// belong to creates that never finished.
    pub fn release_stale_reservations(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
        conn.execute(
            "DELETE FROM meetings \
             WHERE bot_id IS NULL AND status = 'scheduled' AND created_at < ?1",
            params![to_db_time(cutoff)],
        )
        .context("Failed to release stale meeting reservations")
    }
}
