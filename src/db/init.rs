use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits for another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn open_connection(db_path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(db_path).context("Failed to open database connection")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    let _mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .context("Failed to enable WAL journal")?;
    conn.pragma_update(None, "foreign_keys", true)
        .context("Failed to enable foreign keys")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            calendar_synced_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create accounts table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calendar_events (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            join_url TEXT,
            platform TEXT NOT NULL,
            starts_at TEXT NOT NULL,
            ends_at TEXT NOT NULL,
            dispatch_requested INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create calendar_events table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_calendar_events_starts_at
            ON calendar_events(starts_at)",
        [],
    )
    .context("Failed to create calendar_events starts_at index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            calendar_event_id TEXT NOT NULL,
            bot_id TEXT,
            status TEXT NOT NULL,
            platform TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create meetings table")?;

    // At most one live meeting per (account, event).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_meetings_active_event
            ON meetings(account_id, calendar_event_id)
            WHERE status != 'cancelled'",
        [],
    )
    .context("Failed to create meetings event uniqueness index")?;

    // A bot belongs to at most one meeting, ever.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_meetings_bot_id
            ON meetings(bot_id)
            WHERE bot_id IS NOT NULL",
        [],
    )
    .context("Failed to create meetings bot uniqueness index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_status ON meetings(status)",
        [],
    )
    .context("Failed to create meetings status index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bot_records (
            bot_id TEXT PRIMARY KEY,
            meeting_url TEXT NOT NULL,
            platform TEXT NOT NULL,
            current_status TEXT,
            status_changes TEXT NOT NULL,
            recordings TEXT NOT NULL,
            fetched_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create bot_records table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meeting_bot_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id INTEGER NOT NULL REFERENCES meetings(id),
            bot_id TEXT NOT NULL,
            origin TEXT NOT NULL,
            linked_at TEXT NOT NULL,
            UNIQUE(meeting_id, bot_id)
        )",
        [],
    )
    .context("Failed to create meeting_bot_links table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meeting_bot_links_bot ON meeting_bot_links(bot_id)",
        [],
    )
    .context("Failed to create meeting_bot_links bot index")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transcripts (
            meeting_id INTEGER PRIMARY KEY REFERENCES meetings(id),
            bot_id TEXT NOT NULL,
            recording_id TEXT,
            text TEXT NOT NULL,
            segment_count INTEGER NOT NULL,
            video_url TEXT,
            audio_url TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create transcripts table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS automation_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id INTEGER NOT NULL REFERENCES meetings(id),
            automation TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL,
            finished_at TEXT
        )",
        [],
    )
    .context("Failed to create automation_runs table")?;

    Ok(())
}
