//! Calendar collaborator.
//!
//! Events come from outside (OAuth and provider APIs live elsewhere). The
//! shipped source runs a configured command per account and reads a JSON
//! array of events from its stdout.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CalendarConfig;
use crate::db::{AccountRepository, CalendarEventRepository, EventUpsert, Store};
use crate::error::SyncError;
use crate::scheduler::{fan_out, BatchReport, ItemOutcome};
use crate::urls::Platform;

pub const ACCOUNT_ENV: &str = "NOTETAKER_ACCOUNT_ID";

/// One event as reported by the calendar source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExternalEvent {
    pub id: String,
    #[serde(default)]
    pub join_url: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub dispatch_requested: Option<bool>,
}

impl ExternalEvent {
    fn into_upsert(self, account_id: &str) -> EventUpsert {
        let join_url = self
            .join_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        let platform = match (&self.platform, &join_url) {
            (Some(platform), _) => Platform::parse(platform),
            (None, Some(url)) => Platform::detect(url),
            (None, None) => Platform::Other,
        };

        EventUpsert {
            id: self.id,
            account_id: account_id.to_string(),
            join_url,
            platform,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            dispatch_requested: self.dispatch_requested,
        }
    }
}

pub fn parse_events(raw: &str) -> Result<Vec<ExternalEvent>, SyncError> {
    serde_json::from_str(raw)
        .map_err(|e| SyncError::parse(format!("calendar output is not an event list: {e}"), raw))
}

#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch_events(&self, account_id: &str) -> Result<Vec<ExternalEvent>, SyncError>;
}

/// Runs a shell command per account and parses its stdout.
pub struct CommandCalendarSource {
    command: String,
    timeout: std::time::Duration,
}

impl CommandCalendarSource {
    pub fn new(command: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            command: command.into(),
            timeout: std::time::Duration::from_secs(timeout_seconds.max(1)),
        }
    }

    /// `None` when no command is configured.
    pub fn from_config(config: &CalendarConfig) -> Option<Self> {
        let command = config.command.trim();
        (!command.is_empty()).then(|| Self::new(command, config.timeout_seconds))
    }
}

#[async_trait]
impl CalendarSource for CommandCalendarSource {
    async fn fetch_events(&self, account_id: &str) -> Result<Vec<ExternalEvent>, SyncError> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(ACCOUNT_ENV, account_id)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn calendar command")?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("Calendar command failed to run")?,
            Err(_) => {
                return Err(SyncError::Transient(format!(
                    "calendar command timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Transient(format!(
                "calendar command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_events(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Refreshes stored events for accounts whose last sync is stale.
#[derive(Clone)]
pub struct CalendarSync {
    store: Store,
    source: Arc<dyn CalendarSource>,
    interval: Duration,
    max_concurrency: usize,
}

impl CalendarSync {
    pub fn new(
        store: Store,
        source: Arc<dyn CalendarSource>,
        interval: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            source,
            interval,
            max_concurrency,
        }
    }

    /// Fetch and store one account's events. Returns the number stored.
    pub async fn sync_account(&self, account_id: &str, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let events = self.source.fetch_events(account_id).await?;
        let count = events.len();

        let conn = self.store.lock().await;
        crate::db::begin_immediate(&conn)?;
        let stored = events.into_iter().try_for_each(|event| {
            CalendarEventRepository::upsert(&conn, &event.into_upsert(account_id), now)
        });
        match stored.and_then(|()| AccountRepository::mark_synced(&conn, account_id, now)) {
            Ok(()) => crate::db::commit(&conn)?,
            Err(e) => {
                crate::db::rollback(&conn)?;
                return Err(e.into());
            }
        }

        debug!(account_id, events = count, "Calendar synced");
        Ok(count)
    }

    /// Sync every account that is pending.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<BatchReport, SyncError> {
        let accounts = {
            let conn = self.store.lock().await;
            AccountRepository::pending_sync(&conn, now, self.interval)?
        };

        let items = accounts
            .into_iter()
            .map(|id| (format!("account {id}"), id))
            .collect();

        let sync = self.clone();
        let report = fan_out("calendar", items, self.max_concurrency, move |account_id: String| {
            let sync = sync.clone();
            async move {
                sync.sync_account(&account_id, now).await?;
                Ok::<_, SyncError>(ItemOutcome::Processed)
            }
        })
        .await;

        if report.total() > 0 {
            info!("Calendar refresh: {}", report);
        }
        Ok(report)
    }
}
