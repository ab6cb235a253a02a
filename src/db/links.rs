//! History of which bots have been associated with which meetings.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;

use super::{parsed_column, time_column, to_db_time};

/// How a bot came to be linked to a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkOrigin {
    /// We created the bot for this meeting.
    Dispatched,
    /// An existing bot was found in the directory and adopted.
    Discovered,
}

impl LinkOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Discovered => "discovered",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "dispatched" => Ok(Self::Dispatched),
            "discovered" => Ok(Self::Discovered),
            _ => anyhow::bail!("Invalid link origin: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeetingBotLink {
    pub meeting_id: i64,
    pub bot_id: String,
    pub origin: LinkOrigin,
    pub linked_at: DateTime<Utc>,
}

pub struct MeetingBotLinkRepository;

impl MeetingBotLinkRepository {
    /// Record a link. Re-recording an existing link is a no-op.
    pub fn record(
        conn: &Connection,
        meeting_id: i64,
        bot_id: &str,
        origin: LinkOrigin,
        at: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO meeting_bot_links (meeting_id, bot_id, origin, linked_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![meeting_id, bot_id, origin.as_str(), to_db_time(at)],
        )
        .context("Failed to record meeting bot link")?;
        Ok(())
    }

    pub fn for_meeting(conn: &Connection, meeting_id: i64) -> Result<Vec<MeetingBotLink>> {
        let mut stmt = conn
            .prepare(
                "SELECT meeting_id, bot_id, origin, linked_at FROM meeting_bot_links \
                 WHERE meeting_id = ?1 ORDER BY linked_at, id",
            )
            .context("Failed to prepare links query")?;

        let links = stmt
            .query_map(params![meeting_id], |row| {
                Ok(MeetingBotLink {
                    meeting_id: row.get(0)?,
                    bot_id: row.get(1)?,
                    origin: parsed_column(row, 2, LinkOrigin::parse)?,
                    linked_at: time_column(row, 3)?,
                })
            })
            .context("Failed to query links")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map links")?;

        Ok(links)
    }

    /// Every bot id referenced by a meeting or ever linked to one.
    pub fn claimed_bot_ids(conn: &Connection) -> Result<HashSet<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT bot_id FROM meetings WHERE bot_id IS NOT NULL \
                 UNION SELECT bot_id FROM meeting_bot_links",
            )
            .context("Failed to prepare claimed bots query")?;

        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query claimed bots")?
            .collect::<std::result::Result<HashSet<String>, _>>()
            .context("Failed to map claimed bots")?;

        Ok(ids)
    }
}
