use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{opt_time_column, parsed_column, time_column, to_db_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("Invalid automation run status: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutomationRun {
    pub id: i64,
    pub meeting_id: i64,
    pub automation: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct AutomationRunRepository;

impl AutomationRunRepository {
    pub fn queue(
        conn: &Connection,
        meeting_id: i64,
        automation: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO automation_runs (meeting_id, automation, status, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![meeting_id, automation, RunStatus::Queued.as_str(), to_db_time(at)],
        )
        .context("Failed to queue automation run")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish(
        conn: &Connection,
        id: i64,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "UPDATE automation_runs SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, to_db_time(at), id],
        )
        .context("Failed to finish automation run")?;
        Ok(())
    }

    pub fn for_meeting(conn: &Connection, meeting_id: i64) -> Result<Vec<AutomationRun>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, meeting_id, automation, status, error, created_at, finished_at \
                 FROM automation_runs WHERE meeting_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare automation runs query")?;

        let runs = stmt
            .query_map(params![meeting_id], |row| {
                Ok(AutomationRun {
                    id: row.get(0)?,
                    meeting_id: row.get(1)?,
                    automation: row.get(2)?,
                    status: parsed_column(row, 3, RunStatus::parse)?,
                    error: row.get(4)?,
                    created_at: time_column(row, 5)?,
                    finished_at: opt_time_column(row, 6)?,
                })
            })
            .context("Failed to query automation runs")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map automation runs")?;

        Ok(runs)
    }
}
