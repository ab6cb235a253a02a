//! Accounts whose calendars are synced.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use super::{opt_time_column, to_db_time};

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub calendar_synced_at: Option<DateTime<Utc>>,
}

pub struct AccountRepository;

impl AccountRepository {
    /// Register an account if it is not known yet.
    pub fn ensure(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO accounts (id, created_at) VALUES (?1, ?2)",
            params![id, to_db_time(now)],
        )
        .context("Failed to insert account")?;
        Ok(())
    }

    pub fn list(conn: &Connection) -> Result<Vec<Account>> {
        let mut stmt = conn
            .prepare("SELECT id, calendar_synced_at FROM accounts ORDER BY id")
            .context("Failed to prepare accounts query")?;

        let accounts = stmt
            .query_map([], |row| {
                Ok(Account {
                    id: row.get(0)?,
                    calendar_synced_at: opt_time_column(row, 1)?,
                })
            })
            .context("Failed to query accounts")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to map accounts")?;

        Ok(accounts)
    }

    /// Accounts never synced, or last synced more than `interval` ago.
    pub fn pending_sync(
        conn: &Connection,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<String>> {
        let cutoff = to_db_time(now - interval);
        let mut stmt = conn
            .prepare(
                "SELECT id FROM accounts \
                 WHERE calendar_synced_at IS NULL OR calendar_synced_at <= ?1 \
                 ORDER BY id",
            )
            .context("Failed to prepare pending accounts query")?;

        let ids = stmt
            .query_map(params![cutoff], |row| row.get(0))
            .context("Failed to query pending accounts")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("Failed to map pending accounts")?;

        Ok(ids)
    }

    pub fn mark_synced(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<()> {
        conn.execute(
            "UPDATE accounts SET calendar_synced_at = ?1 WHERE id = ?2",
            params![to_db_time(at), id],
        )
        .context("Failed to mark account synced")?;
        Ok(())
    }
}
