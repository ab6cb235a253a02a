//! Local cache of bot state as last reported by the directory.
//!
//! A row is always replaced wholesale from a fresh `get`; histories are never
//! merged.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{parsed_column, to_db_time};
use crate::bots::BotRecord;
use crate::urls::Platform;

pub struct BotRecordRepository;

impl BotRecordRepository {
    pub fn replace(conn: &Connection, bot: &BotRecord, fetched_at: DateTime<Utc>) -> Result<()> {
        let status_changes =
            serde_json::to_string(&bot.status_changes).context("Failed to encode status changes")?;
        let recordings =
            serde_json::to_string(&bot.recordings).context("Failed to encode recordings")?;

        conn.execute(
            "INSERT OR REPLACE INTO bot_records \
                (bot_id, meeting_url, platform, current_status, status_changes, recordings, fetched_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bot.id,
                bot.meeting_url,
                bot.platform.as_str(),
                bot.derived().current,
                status_changes,
                recordings,
                to_db_time(fetched_at),
            ],
        )
        .context("Failed to store bot record")?;
        Ok(())
    }

    pub fn get(conn: &Connection, bot_id: &str) -> Result<Option<BotRecord>> {
        conn.query_row(
            "SELECT bot_id, meeting_url, platform, status_changes, recordings \
             FROM bot_records WHERE bot_id = ?1",
            params![bot_id],
            |row| {
                Ok(BotRecord {
                    id: row.get(0)?,
                    meeting_url: row.get(1)?,
                    platform: parsed_column(row, 2, |raw| Ok(Platform::parse(raw)))?,
                    status_changes: parsed_column(row, 3, |raw| Ok(serde_json::from_str(raw)?))?,
                    recordings: parsed_column(row, 4, |raw| Ok(serde_json::from_str(raw)?))?,
                })
            },
        )
        .optional()
        .context("Failed to query bot record")
    }
}
