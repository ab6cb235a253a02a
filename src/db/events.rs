//! Calendar events as delivered by the calendar collaborator.
//!
//! Everything except `dispatch_requested` is owned by calendar sync; the
//! reconciler only ever toggles that flag.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{parsed_column, time_column, to_db_time};
use crate::urls::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarEvent {
    pub id: String,
    pub account_id: String,
    pub join_url: Option<String>,
    pub platform: Platform,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dispatch_requested: bool,
}

impl CalendarEvent {
    /// The join URL, if present and non-blank.
    pub fn join_url(&self) -> Option<&str> {
        self.join_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// An insert-or-update from calendar sync. `dispatch_requested: None` keeps
/// the stored flag.
#[derive(Debug, Clone)]
pub struct EventUpsert {
    pub id: String,
    pub account_id: String,
    pub join_url: Option<String>,
    pub platform: Platform,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub dispatch_requested: Option<bool>,
}

const EVENT_COLUMNS: &str = "e.id, e.account_id, e.join_url, e.platform, e.starts_at, e.ends_at, \
                             e.dispatch_requested";

fn map_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<CalendarEvent> {
    Ok(CalendarEvent {
        id: row.get(0)?,
        account_id: row.get(1)?,
        join_url: row.get(2)?,
        platform: parsed_column(row, 3, |raw| Ok(Platform::parse(raw)))?,
        starts_at: time_column(row, 4)?,
        ends_at: time_column(row, 5)?,
        dispatch_requested: row.get(6)?,
    })
}

pub struct CalendarEventRepository;

impl CalendarEventRepository {
    pub fn upsert(conn: &Connection, event: &EventUpsert, now: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT INTO calendar_events \
                (id, account_id, join_url, platform, starts_at, ends_at, dispatch_requested, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, COALESCE(?7, 0), ?8) \
             ON CONFLICT(id) DO UPDATE SET \
                account_id = excluded.account_id, \
                join_url = excluded.join_url, \
                platform = excluded.platform, \
                starts_at = excluded.starts_at, \
                ends_at = excluded.ends_at, \
                dispatch_requested = COALESCE(?7, calendar_events.dispatch_requested), \
                updated_at = excluded.updated_at",
            params![
                event.id,
                event.account_id,
                event.join_url,
                event.platform.as_str(),
                to_db_time(event.starts_at),
                to_db_time(event.ends_at),
                event.dispatch_requested,
                to_db_time(now),
            ],
        )
        .context("Failed to upsert calendar event")?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<CalendarEvent>> {
        conn.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM calendar_events e WHERE e.id = ?1"),
            params![id],
            map_event,
        )
        .optional()
        .context("Failed to query calendar event")
    }

    /// Returns false when the event does not exist.
    pub fn set_dispatch_requested(
        conn: &Connection,
        id: &str,
        requested: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE calendar_events SET dispatch_requested = ?1, updated_at = ?2 WHERE id = ?3",
                params![requested, to_db_time(now), id],
            )
            .context("Failed to update dispatch flag")?;
        Ok(changed > 0)
    }

    /// Events with dispatch requested and a join URL, starting no later than
    /// `horizon`, not yet over at `now`, and without a live meeting.
    pub fn due_for_dispatch(
        conn: &Connection,
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events e \
                 WHERE e.dispatch_requested = 1 \
                   AND e.join_url IS NOT NULL AND TRIM(e.join_url) != '' \
                   AND e.starts_at <= ?1 AND e.ends_at > ?2 \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM meetings m \
                       WHERE m.account_id = e.account_id \
                         AND m.calendar_event_id = e.id \
                         AND m.status != 'cancelled') \
                 ORDER BY e.starts_at, e.id"
            ))
            .context("Failed to prepare due events query")?;

        let events = stmt
            .query_map(params![to_db_time(horizon), to_db_time(now)], map_event)
            .context("Failed to query due events")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map due events")?;

        Ok(events)
    }

    /// Events with dispatch requested and a join URL, starting within
    /// `[since, until]`, whose live meeting is missing or has no bot.
    /// Pairs each event with the id of that bot-less meeting, if any.
    pub fn missing_bot(
        conn: &Connection,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(CalendarEvent, Option<i64>)>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS}, m.id FROM calendar_events e \
                 LEFT JOIN meetings m \
                   ON m.account_id = e.account_id \
                  AND m.calendar_event_id = e.id \
                  AND m.status != 'cancelled' \
                 WHERE e.dispatch_requested = 1 \
                   AND e.join_url IS NOT NULL AND TRIM(e.join_url) != '' \
                   AND e.starts_at >= ?1 AND e.starts_at <= ?2 \
                   AND (m.id IS NULL OR m.bot_id IS NULL) \
                 ORDER BY e.starts_at, e.id"
            ))
            .context("Failed to prepare events missing bot query")?;

        let rows = stmt
            .query_map(params![to_db_time(since), to_db_time(until)], |row| {
                Ok((map_event(row)?, row.get::<_, Option<i64>>(7)?))
            })
            .context("Failed to query events missing bot")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map events missing bot")?;

        Ok(rows)
    }

    /// Events no longer requesting a bot whose live meeting is still
    /// `scheduled`. Calendar sync can clear the flag after a dispatch.
    pub fn withdrawn_with_scheduled_meeting(conn: &Connection) -> Result<Vec<CalendarEvent>> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events e \
                 JOIN meetings m \
                   ON m.account_id = e.account_id \
                  AND m.calendar_event_id = e.id \
                 WHERE e.dispatch_requested = 0 AND m.status = 'scheduled' \
                 ORDER BY e.starts_at, e.id"
            ))
            .context("Failed to prepare withdrawn events query")?;

        let events = stmt
            .query_map([], map_event)
            .context("Failed to query withdrawn events")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map withdrawn events")?;

        Ok(events)
    }
}
