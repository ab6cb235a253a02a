//! Polling bots and advancing meetings from their status history.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::Reconciler;
use crate::db::{BotRecordRepository, MeetingRepository};
use crate::error::SyncError;
use crate::meeting::{next_status, MeetingStatus};
use crate::scheduler::{fan_out, BatchReport, ItemOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Unchanged,
    Advanced {
        from: MeetingStatus,
        to: MeetingStatus,
    },
    Failed { reason: String },
    Skipped { reason: String },
}

impl SyncOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

impl Reconciler {
    /// Refresh one meeting's bot and apply whatever its status implies.
    ///
    /// Transient directory errors propagate untouched; only a 404 for the
    /// bot fails the meeting.
    pub async fn sync_meeting(&self, meeting_id: i64) -> Result<SyncOutcome, SyncError> {
        let (meeting, previous) = {
            let conn = self.store.lock().await;
            let Some(meeting) = MeetingRepository::get(&conn, meeting_id)? else {
                return Ok(SyncOutcome::skipped("meeting not found"));
            };
            let previous = match &meeting.bot_id {
                Some(bot_id) => BotRecordRepository::get(&conn, bot_id)?,
                None => None,
            };
            (meeting, previous)
        };

        if meeting.status.is_terminal() {
            return Ok(SyncOutcome::skipped(format!("meeting is {}", meeting.status)));
        }
        let Some(bot_id) = meeting.bot_id.clone() else {
            return Ok(SyncOutcome::skipped("meeting has no bot"));
        };

        let bot = match self.directory.get_bot(&bot_id).await {
            Ok(bot) => bot,
            Err(err) if err.is_bot_missing() => {
                let reason = format!("bot {bot_id} no longer exists in the directory");
                let conn = self.store.lock().await;
                MeetingRepository::fail(&conn, meeting_id, &reason, Utc::now())?;
                warn!(meeting_id, bot_id = %bot_id, "Meeting failed: {}", reason);
                return Ok(SyncOutcome::Failed { reason });
            }
            Err(err) => return Err(err),
        };

        if let Some(previous) = &previous {
            if !bot.extends(previous) {
                warn!(
                    meeting_id,
                    bot_id = %bot_id,
                    "Bot status history was rewritten; replacing cached copy"
                );
            }
        }

        let derived = bot.derived();
        let now = Utc::now();
        let target = next_status(meeting.status, derived.current.as_deref());

        let outcome = {
            let conn = self.store.lock().await;
            BotRecordRepository::replace(&conn, &bot, now)?;
            MeetingRepository::set_times(&conn, meeting_id, derived.started_at, derived.ended_at)?;

            match target {
                None => SyncOutcome::Unchanged,
                Some(MeetingStatus::Failed) => {
                    let reason = format!(
                        "bot reported {}",
                        derived.current.as_deref().unwrap_or("an error")
                    );
                    if MeetingRepository::fail(&conn, meeting_id, &reason, now)? {
                        SyncOutcome::Failed { reason }
                    } else {
                        SyncOutcome::Unchanged
                    }
                }
                Some(to) => {
                    if MeetingRepository::transition(&conn, meeting_id, meeting.status, to, now)? {
                        SyncOutcome::Advanced {
                            from: meeting.status,
                            to,
                        }
                    } else {
                        // Another worker moved it first.
                        SyncOutcome::Unchanged
                    }
                }
            }
        };

        match &outcome {
            SyncOutcome::Advanced { from, to } => {
                info!(meeting_id, bot_id = %bot_id, "Meeting {} -> {}", from, to);
                if *to == MeetingStatus::Processing {
                    self.enqueue_transcript(meeting_id);
                }
            }
            SyncOutcome::Failed { reason } => {
                warn!(meeting_id, bot_id = %bot_id, "Meeting failed: {}", reason);
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Poll the bot of every meeting that has not finished recording.
    pub async fn poll_active(&self) -> Result<BatchReport, SyncError> {
        let meetings = {
            let conn = self.store.lock().await;
            MeetingRepository::list_by_status(
                &conn,
                &[MeetingStatus::Scheduled, MeetingStatus::Recording],
            )?
        };

        let items = meetings
            .into_iter()
            .filter(|m| m.bot_id.is_some())
            .map(|m| (format!("meeting {}", m.id), m.id))
            .collect();

        let reconciler = self.clone();
        Ok(fan_out("poll", items, self.settings.max_concurrency, move |meeting_id| {
            let reconciler = reconciler.clone();
            async move {
                Ok::<_, SyncError>(match reconciler.sync_meeting(meeting_id).await? {
                    SyncOutcome::Skipped { .. } => ItemOutcome::Skipped,
                    _ => ItemOutcome::Processed,
                })
            }
        })
        .await)
    }
}
