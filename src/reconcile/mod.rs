//! Reconciliation between calendar events, meeting records and the bots the
//! directory hosts.
//!
//! The reconciler owns every write to `meetings`. It is cheap to clone; all
//! state lives in the store and the bot directory.

pub mod discovery;
pub mod dispatch;
pub mod sync;

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bots::{BotDirectory, CreateBotRequest};
use crate::config::Config;
use crate::db::{CalendarEvent, MeetingRepository, Store};
use crate::error::SyncError;
use crate::meeting::MeetingStatus;
use crate::queue::EnqueueError;
use crate::scheduler::{fan_out, BatchReport, ItemOutcome};
use crate::transcript::{TranscriptJob, TranscriptQueue};

pub use discovery::{rank_candidates, select_candidate};
pub use dispatch::{DispatchOutcome, WithdrawOutcome};
pub use sync::SyncOutcome;

/// Parameters the reconciler takes from configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub bot_name: String,
    pub transcript_provider: Option<String>,
    pub lead_time: Duration,
    pub discovery_lookback: Duration,
    pub max_concurrency: usize,
    /// Age at which a bot-less reservation counts as abandoned. Longer than
    /// any create call can take.
    pub reservation_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &Config) -> Self {
        let provider = config.bot_directory.transcript_provider.trim();
        Self {
            bot_name: config.bot_directory.bot_name.clone(),
            transcript_provider: (!provider.is_empty()).then(|| provider.to_string()),
            lead_time: config.schedule.lead_time(),
            discovery_lookback: config.schedule.discovery_lookback(),
            max_concurrency: config.schedule.max_concurrency.max(1),
            reservation_timeout: Duration::seconds(
                (config.bot_directory.timeout_seconds as i64).saturating_mul(2) + 60,
            ),
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    directory: Arc<dyn BotDirectory>,
    transcripts: Option<TranscriptQueue>,
    settings: Arc<ReconcilerSettings>,
}

impl Reconciler {
    pub fn new(store: Store, directory: Arc<dyn BotDirectory>, settings: ReconcilerSettings) -> Self {
        Self {
            store,
            directory,
            transcripts: None,
            settings: Arc::new(settings),
        }
    }

    /// Hand meetings that reach `processing` to this queue.
    pub fn with_transcript_queue(mut self, queue: TranscriptQueue) -> Self {
        self.transcripts = Some(queue);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    fn create_request(&self, event: &CalendarEvent, join_url: &str) -> CreateBotRequest {
        let mut request = CreateBotRequest::new(join_url, &self.settings.bot_name);
        request.join_at = Some(event.starts_at);
        request.transcript_provider = self.settings.transcript_provider.clone();
        request
            .metadata
            .insert("calendar_event_id".to_string(), event.id.clone());
        request
            .metadata
            .insert("account_id".to_string(), event.account_id.clone());
        request
    }

    /// Queue the transcript fetch for a meeting. Returns false when there is
    /// no queue or the job could not be queued; the transcript sweep retries.
    pub fn enqueue_transcript(&self, meeting_id: i64) -> bool {
        let Some(queue) = &self.transcripts else {
            debug!(meeting_id, "No transcript queue configured");
            return false;
        };

        match queue.enqueue(TranscriptJob { meeting_id }) {
            Ok(_ticket) => true,
            Err(EnqueueError::Duplicate(_)) => {
                debug!(meeting_id, "Transcript fetch already queued");
                true
            }
            Err(e) => {
                warn!(meeting_id, "Could not queue transcript fetch: {}", e);
                false
            }
        }
    }

    /// Queue a transcript fetch for every meeting waiting in `processing`.
    pub async fn sweep_transcripts(&self) -> Result<BatchReport, SyncError> {
        let meetings = {
            let conn = self.store.lock().await;
            MeetingRepository::list_by_status(&conn, &[MeetingStatus::Processing])?
        };

        let items = meetings
            .into_iter()
            .map(|m| (format!("meeting {}", m.id), m))
            .collect();

        let reconciler = self.clone();
        Ok(fan_out("transcripts", items, self.settings.max_concurrency, move |meeting| {
            let reconciler = reconciler.clone();
            async move {
                if meeting.bot_id.is_none() {
                    return Ok(ItemOutcome::Skipped);
                }
                if reconciler.enqueue_transcript(meeting.id) {
                    Ok(ItemOutcome::Processed)
                } else {
                    Err(SyncError::Transient(format!(
                        "transcript fetch for meeting {} not queued",
                        meeting.id
                    )))
                }
            }
        })
        .await)
    }
}
