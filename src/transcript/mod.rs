//! Transcript fetch pipeline.
//!
//! Runs for meetings in `processing`: resolve the transcript of the bot's
//! first completed recording, download it through a freshly requested URL,
//! flatten it to speaker-attributed text, persist it, move the meeting to
//! `ready`, and queue the enabled automations.

pub mod format;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::automation::{AutomationInput, AutomationJob};
use crate::bots::{canonical_code, status::codes, BotDirectory, Recording};
use crate::db::{
    self, AutomationRunRepository, MeetingRepository, RunStatus, Store, TranscriptRecord,
    TranscriptRepository,
};
use crate::error::SyncError;
use crate::meeting::MeetingStatus;
use crate::queue::{Job, JobHandler, JobQueue};

pub use format::{flatten, parse_segments, Segment};

pub type AutomationQueue = JobQueue<AutomationJob, RunStatus>;

/// Fetch the transcript for one meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptJob {
    pub meeting_id: i64,
}

impl Job for TranscriptJob {
    fn key(&self) -> String {
        format!("transcript:{}", self.meeting_id)
    }
}

pub type TranscriptQueue = JobQueue<TranscriptJob, PipelineOutcome>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Transcript stored and meeting is `ready`.
    Ready {
        segments: usize,
        automations_queued: usize,
    },
    /// The directory has no usable transcript yet; the sweep retries.
    Pending(String),
    /// The meeting is not (or no longer) waiting for a transcript.
    Skipped(String),
    /// The directory reported the transcript as failed.
    Failed(String),
}

/// Automations queued after a transcript lands.
#[derive(Clone)]
pub struct AutomationDispatch {
    pub queue: AutomationQueue,
    pub names: Vec<String>,
}

pub struct TranscriptPipeline {
    store: Store,
    directory: Arc<dyn BotDirectory>,
    automations: Option<AutomationDispatch>,
}

impl TranscriptPipeline {
    pub fn new(
        store: Store,
        directory: Arc<dyn BotDirectory>,
        automations: Option<AutomationDispatch>,
    ) -> Self {
        Self {
            store,
            directory,
            automations,
        }
    }

    pub async fn run(&self, meeting_id: i64) -> Result<PipelineOutcome, SyncError> {
        let meeting = {
            let conn = self.store.lock().await;
            MeetingRepository::get(&conn, meeting_id)?
        };
        let Some(meeting) = meeting else {
            return Ok(PipelineOutcome::Skipped(format!("meeting {meeting_id} not found")));
        };
        if meeting.status != MeetingStatus::Processing {
            return Ok(PipelineOutcome::Skipped(format!("meeting is {}", meeting.status)));
        }
        let Some(bot_id) = meeting.bot_id.clone() else {
            return Ok(PipelineOutcome::Skipped("meeting has no bot".to_string()));
        };

        let recordings = self.directory.recordings(&bot_id).await?;
        let recording = match select_recording(&recordings) {
            Selection::Ready(recording) => recording,
            Selection::Pending(reason) => return Ok(PipelineOutcome::Pending(reason)),
            Selection::Failed(reason) => {
                let conn = self.store.lock().await;
                MeetingRepository::fail(&conn, meeting_id, &reason, Utc::now())?;
                warn!(meeting_id, bot_id = %bot_id, "Transcript failed: {}", reason);
                return Ok(PipelineOutcome::Failed(reason));
            }
        };
        let Some(transcript_id) = recording.transcript_id.clone() else {
            return Ok(PipelineOutcome::Pending("recording has no transcript".to_string()));
        };

        // Download URLs expire; always ask for a new one.
        let url = self.directory.transcript_download_url(&transcript_id).await?;
        let payload = self.directory.download(&url).await?;

        let segments = parse_segments(&payload)?;
        let text = flatten(&segments);
        let now = Utc::now();

        let record = TranscriptRecord {
            meeting_id,
            bot_id: bot_id.clone(),
            recording_id: Some(recording.id.clone()),
            text: text.clone(),
            segment_count: segments.len(),
            video_url: recording.video_url.clone(),
            audio_url: recording.audio_url.clone(),
            created_at: now,
        };

        let names = self
            .automations
            .as_ref()
            .map(|a| a.names.clone())
            .unwrap_or_default();

        let runs = {
            let conn = self.store.lock().await;
            db::begin_immediate(&conn)?;
            match persist_ready(&conn, &record, &names, now) {
                Ok(Some(runs)) => {
                    db::commit(&conn)?;
                    runs
                }
                Ok(None) => {
                    db::rollback(&conn)?;
                    return Ok(PipelineOutcome::Skipped(
                        "meeting left processing while the transcript was fetched".to_string(),
                    ));
                }
                Err(err) => {
                    if let Err(rollback_err) = db::rollback(&conn) {
                        warn!("Rollback failed: {:#}", rollback_err);
                    }
                    return Err(err.into());
                }
            }
        };

        info!(
            meeting_id,
            bot_id = %bot_id,
            segments = segments.len(),
            "Transcript stored, meeting ready"
        );

        let input = AutomationInput {
            meeting_id,
            bot_id,
            account_id: meeting.account_id.clone(),
            calendar_event_id: meeting.calendar_event_id.clone(),
            transcript_text: text,
        };
        let automations_queued = self.queue_automations(runs, &input).await;

        Ok(PipelineOutcome::Ready {
            segments: segments.len(),
            automations_queued,
        })
    }

    async fn queue_automations(&self, runs: Vec<(i64, String)>, input: &AutomationInput) -> usize {
        let Some(dispatch) = &self.automations else {
            return 0;
        };

        let mut queued = 0;
        for (run_id, automation) in runs {
            let job = AutomationJob {
                run_id,
                automation: automation.clone(),
                input: input.clone(),
            };
            match dispatch.queue.enqueue(job) {
                Ok(_ticket) => queued += 1,
                Err(e) => {
                    warn!(
                        meeting_id = input.meeting_id,
                        "Could not queue automation {}: {}", automation, e
                    );
                    let conn = self.store.lock().await;
                    if let Err(e) = AutomationRunRepository::finish(
                        &conn,
                        run_id,
                        RunStatus::Failed,
                        Some(&e.to_string()),
                        Utc::now(),
                    ) {
                        warn!("Failed to record automation run {}: {:#}", run_id, e);
                    }
                }
            }
        }
        queued
    }
}

/// Store the transcript, move the meeting to `ready` and create the
/// automation run rows. `None` when the meeting was no longer `processing`.
fn persist_ready(
    conn: &rusqlite::Connection,
    record: &TranscriptRecord,
    automations: &[String],
    now: chrono::DateTime<Utc>,
) -> Result<Option<Vec<(i64, String)>>> {
    if !MeetingRepository::transition(
        conn,
        record.meeting_id,
        MeetingStatus::Processing,
        MeetingStatus::Ready,
        now,
    )? {
        return Ok(None);
    }

    TranscriptRepository::upsert(conn, record)?;

    let mut runs = Vec::with_capacity(automations.len());
    for name in automations {
        let run_id = AutomationRunRepository::queue(conn, record.meeting_id, name, now)?;
        runs.push((run_id, name.clone()));
    }
    Ok(Some(runs))
}

enum Selection<'a> {
    Ready(&'a Recording),
    Pending(String),
    Failed(String),
}

/// The first completed recording decides; its transcript must be done.
fn select_recording(recordings: &[Recording]) -> Selection<'_> {
    let Some(recording) = recordings.iter().find(|r| r.is_complete()) else {
        return Selection::Pending("no completed recording yet".to_string());
    };

    match recording.transcript_status.as_deref().map(canonical_code) {
        Some(status) if status == codes::DONE => Selection::Ready(recording),
        Some(status) if status == "failed" || status == codes::ERROR || status == codes::FATAL => {
            Selection::Failed(format!("transcript for recording {} {}", recording.id, status))
        }
        Some(status) => Selection::Pending(format!("transcript is {status}")),
        // Some directories omit transcript status; the id alone is enough.
        None if recording.transcript_id.is_some() => Selection::Ready(recording),
        None => Selection::Pending("recording has no transcript".to_string()),
    }
}

#[async_trait]
impl JobHandler<TranscriptJob> for TranscriptPipeline {
    type Output = PipelineOutcome;

    async fn handle(&self, job: TranscriptJob) -> Result<PipelineOutcome> {
        match self.run(job.meeting_id).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let SyncError::Parse { sample, .. } = &err {
                    warn!(
                        meeting_id = job.meeting_id,
                        kind = err.kind(),
                        sample = %sample,
                        "Transcript payload rejected"
                    );
                }
                Err(err.into())
            }
        }
    }
}
