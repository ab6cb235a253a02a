//! Bot dispatch with the duplicate-creation guard, and its withdrawal.
//!
//! Creation reserves the event first: a bot-less `scheduled` meeting is
//! inserted in a short write transaction, and the unique live-meeting index
//! turns every concurrent attempt into `AlreadySatisfied`. The external create
//! runs with the store unlocked, then a second short transaction attaches the
//! bot. A failed create releases the reservation. A crash mid-create leaves a
//! reservation that `dispatch_due` releases once it is older than the create
//! timeout; any bot that did get created is linked by the proactive sweep and
//! discovery.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use super::discovery::select_candidate;
use super::Reconciler;
use crate::bots::BotRecord;
use crate::db::{
    self, CalendarEvent, CalendarEventRepository, LinkOrigin, MeetingBotLinkRepository,
    MeetingRepository, NewMeeting,
};
use crate::error::SyncError;
use crate::meeting::MeetingStatus;
use crate::scheduler::{fan_out, BatchReport, ItemOutcome};
use crate::urls::Platform;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A new bot was created and a meeting recorded for it.
    Created { meeting_id: i64, bot_id: String },
    /// An existing, unclaimed bot was linked instead of creating one.
    Linked {
        meeting_id: i64,
        bot_id: String,
        status: MeetingStatus,
    },
    /// The event already has a live meeting.
    AlreadySatisfied { meeting_id: i64 },
    /// Another worker claimed the event or bot first.
    AlreadyClaimed { bot_id: String },
    NotEligible { reason: String },
}

impl DispatchOutcome {
    fn not_eligible(reason: impl Into<String>) -> Self {
        Self::NotEligible {
            reason: reason.into(),
        }
    }

    /// True when the call changed nothing.
    pub fn is_noop(&self) -> bool {
        !matches!(self, Self::Created { .. } | Self::Linked { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WithdrawOutcome {
    EventNotFound,
    /// Nothing had been dispatched yet.
    NoMeeting,
    Cancelled {
        meeting_id: i64,
        bot_deleted: bool,
    },
    /// The bot already started; the meeting keeps going.
    AlreadyStarted {
        meeting_id: i64,
        status: MeetingStatus,
    },
}

fn rollback_quietly(conn: &Connection) {
    if let Err(e) = db::rollback(conn) {
        warn!("Rollback failed: {:#}", e);
    }
}

fn platform_for(event: &CalendarEvent, join_url: &str) -> Platform {
    match event.platform {
        Platform::Other => Platform::detect(join_url),
        platform => platform,
    }
}

/// Why an event cannot be dispatched at `now`, if anything.
fn ineligibility(event: &CalendarEvent, now: DateTime<Utc>) -> Option<&'static str> {
    if !event.dispatch_requested {
        Some("dispatch not requested")
    } else if event.join_url().is_none() {
        Some("event has no join URL")
    } else if event.ends_at <= now {
        Some("event is over")
    } else {
        None
    }
}

impl Reconciler {
    /// Create a bot for an event through the guarded path.
    pub async fn dispatch(&self, event_id: &str) -> Result<DispatchOutcome, SyncError> {
        let event = {
            let conn = self.store.lock().await;
            CalendarEventRepository::get(&conn, event_id)?
        };
        let Some(event) = event else {
            return Ok(DispatchOutcome::not_eligible(format!(
                "event {event_id} not found"
            )));
        };
        if let Some(reason) = ineligibility(&event, Utc::now()) {
            return Ok(DispatchOutcome::not_eligible(reason));
        }

        self.create_guarded(&event).await
    }

    /// Mark an event as wanting a bot and dispatch it right away. The bot is
    /// scheduled to join at the event's start.
    pub async fn request_dispatch(&self, event_id: &str) -> Result<DispatchOutcome, SyncError> {
        let found = {
            let conn = self.store.lock().await;
            CalendarEventRepository::set_dispatch_requested(&conn, event_id, true, Utc::now())?
        };
        if !found {
            return Ok(DispatchOutcome::not_eligible(format!(
                "event {event_id} not found"
            )));
        }

        info!(event_id, "Dispatch requested");
        self.dispatch(event_id).await
    }

    /// Clear the dispatch flag. A meeting still `scheduled` is cancelled and
    /// its bot deleted on a best-effort basis.
    pub async fn withdraw_dispatch(&self, event_id: &str) -> Result<WithdrawOutcome, SyncError> {
        let now = Utc::now();
        let (meeting_id, bot_id) = {
            let conn = self.store.lock().await;
            let Some(event) = CalendarEventRepository::get(&conn, event_id)? else {
                return Ok(WithdrawOutcome::EventNotFound);
            };
            CalendarEventRepository::set_dispatch_requested(&conn, event_id, false, now)?;

            let Some(meeting) =
                MeetingRepository::find_active_for_event(&conn, &event.account_id, &event.id)?
            else {
                return Ok(WithdrawOutcome::NoMeeting);
            };

            if meeting.status != MeetingStatus::Scheduled
                || !MeetingRepository::transition(
                    &conn,
                    meeting.id,
                    MeetingStatus::Scheduled,
                    MeetingStatus::Cancelled,
                    now,
                )?
            {
                info!(
                    event_id,
                    meeting_id = meeting.id,
                    "Dispatch withdrawn but meeting is {}; leaving it running",
                    meeting.status
                );
                return Ok(WithdrawOutcome::AlreadyStarted {
                    meeting_id: meeting.id,
                    status: meeting.status,
                });
            }
            (meeting.id, meeting.bot_id)
        };

        info!(event_id, meeting_id, "Meeting cancelled");

        let bot_deleted = match bot_id {
            Some(bot_id) => match self.directory.delete_bot(&bot_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        meeting_id,
                        bot_id = %bot_id,
                        kind = e.kind(),
                        "Failed to delete bot of cancelled meeting: {}",
                        e
                    );
                    false
                }
            },
            None => false,
        };

        Ok(WithdrawOutcome::Cancelled {
            meeting_id,
            bot_deleted,
        })
    }

    /// Reserve the event, create the bot unlocked, then attach it.
    pub(super) async fn create_guarded(
        &self,
        event: &CalendarEvent,
    ) -> Result<DispatchOutcome, SyncError> {
        let Some(join_url) = event.join_url() else {
            return Ok(DispatchOutcome::not_eligible("event has no join URL"));
        };
        let request = self.create_request(event, join_url);

        let meeting_id = match self.reserve(event, platform_for(event, join_url)).await? {
            Reservation::Reserved(meeting_id) => meeting_id,
            Reservation::Existing(meeting_id) => {
                return Ok(DispatchOutcome::AlreadySatisfied { meeting_id });
            }
        };

        let bot_id = match self.directory.create_bot(&request).await {
            Ok(bot_id) => bot_id,
            Err(e) => {
                self.release_reservation(meeting_id).await;
                return Err(e);
            }
        };

        let attached = {
            let conn = self.store.lock().await;
            db::begin_immediate(&conn)?;
            match attach_in_transaction(&conn, meeting_id, &bot_id, Utc::now()) {
                Ok(Attach::Attached) => {
                    db::commit(&conn)?;
                    Attach::Attached
                }
                Ok(other) => {
                    rollback_quietly(&conn);
                    other
                }
                Err(e) => {
                    rollback_quietly(&conn);
                    let err = SyncError::from(e);
                    if !err.is_conflict() {
                        // The bot exists without a meeting; discovery links it.
                        return Err(err);
                    }
                    Attach::BotClaimed
                }
            }
        };

        match attached {
            Attach::Attached => {
                info!(
                    event_id = %event.id,
                    meeting_id,
                    bot_id = %bot_id,
                    "Bot dispatched"
                );
                Ok(DispatchOutcome::Created { meeting_id, bot_id })
            }
            Attach::BotClaimed => {
                // The directory handed back a bot another meeting owns; keep it.
                warn!(
                    event_id = %event.id,
                    bot_id = %bot_id,
                    "Created bot is already claimed by another meeting"
                );
                self.release_reservation(meeting_id).await;
                Ok(DispatchOutcome::AlreadyClaimed { bot_id })
            }
            Attach::Superseded(outcome) => {
                info!(
                    event_id = %event.id,
                    meeting_id,
                    bot_id = %bot_id,
                    "Reservation changed during create, removing surplus bot"
                );
                if let Err(e) = self.directory.delete_bot(&bot_id).await {
                    warn!(bot_id = %bot_id, "Failed to delete surplus bot: {}", e);
                }
                Ok(outcome)
            }
        }
    }

    async fn reserve(
        &self,
        event: &CalendarEvent,
        platform: Platform,
    ) -> Result<Reservation, SyncError> {
        let conn = self.store.lock().await;
        db::begin_immediate(&conn)?;

        let reserved =
            match MeetingRepository::find_active_for_event(&conn, &event.account_id, &event.id) {
                Ok(Some(existing)) => {
                    rollback_quietly(&conn);
                    return Ok(Reservation::Existing(existing.id));
                }
                Ok(None) => MeetingRepository::insert(
                    &conn,
                    &NewMeeting {
                        account_id: &event.account_id,
                        calendar_event_id: &event.id,
                        bot_id: None,
                        status: MeetingStatus::Scheduled,
                        platform,
                    },
                    Utc::now(),
                ),
                Err(e) => Err(e),
            };

        match reserved {
            Ok(meeting_id) => {
                db::commit(&conn)?;
                Ok(Reservation::Reserved(meeting_id))
            }
            Err(e) => {
                rollback_quietly(&conn);
                let err = SyncError::from(e);
                if err.is_conflict() {
                    // Another connection reserved the event first.
                    if let Some(existing) =
                        MeetingRepository::find_active_for_event(&conn, &event.account_id, &event.id)?
                    {
                        return Ok(Reservation::Existing(existing.id));
                    }
                }
                Err(err)
            }
        }
    }

    async fn release_reservation(&self, meeting_id: i64) {
        let conn = self.store.lock().await;
        if let Err(e) = MeetingRepository::release_reservation(&conn, meeting_id) {
            warn!(meeting_id, "Failed to release meeting reservation: {:#}", e);
        }
    }

    /// Record `bot` as the bot of `event`'s meeting, creating the meeting if
    /// needed. The meeting status follows the bot's current status.
    pub(super) async fn link_bot(
        &self,
        event: &CalendarEvent,
        bot: &BotRecord,
        origin: LinkOrigin,
    ) -> Result<DispatchOutcome, SyncError> {
        let derived = bot.derived();
        let target = derived
            .current
            .as_deref()
            .and_then(crate::meeting::status_for_bot_code)
            .unwrap_or(MeetingStatus::Scheduled);
        let now = Utc::now();

        let linked = {
            let conn = self.store.lock().await;
            db::begin_immediate(&conn)?;
            match link_in_transaction(&conn, event, bot, target, origin, now) {
                Ok(outcome) => {
                    if outcome.is_noop() {
                        rollback_quietly(&conn);
                    } else {
                        db::commit(&conn)?;
                    }
                    outcome
                }
                Err(e) => {
                    rollback_quietly(&conn);
                    let err = SyncError::from(e);
                    if !err.is_conflict() {
                        return Err(err);
                    }
                    DispatchOutcome::AlreadyClaimed {
                        bot_id: bot.id.clone(),
                    }
                }
            }
        };

        if let DispatchOutcome::Linked {
            meeting_id, status, ..
        } = &linked
        {
            info!(
                event_id = %event.id,
                meeting_id,
                bot_id = %bot.id,
                origin = origin.as_str(),
                "Linked existing bot as {}",
                status
            );
            if *status == MeetingStatus::Processing {
                self.enqueue_transcript(*meeting_id);
            }
        }

        Ok(linked)
    }

    /// Dispatch every flagged event starting within the lead time. An
    /// unclaimed bot already joined to the same call is linked first; only
    /// then is a new one created.
    ///
    /// Withdrawn events are cancelled first, and reservations left by
    /// creates that never finished are released so their events come due
    /// again.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<BatchReport, SyncError> {
        let mut report = self.cancel_withdrawn().await?;

        let horizon = now + self.settings.lead_time;
        let events = {
            let conn = self.store.lock().await;
            let released = MeetingRepository::release_stale_reservations(
                &conn,
                now - self.settings.reservation_timeout,
            )?;
            if released > 0 {
                warn!(released, "Released reservations of unfinished bot creates");
            }
            CalendarEventRepository::due_for_dispatch(&conn, now, horizon)?
        };
        if events.is_empty() {
            return Ok(report);
        }

        // Without a listing an orphaned bot could be duplicated; wait for
        // the next tick instead.
        let bots = Arc::new(self.directory.list_bots().await?);
        let claimed: Arc<HashSet<String>> = {
            let conn = self.store.lock().await;
            Arc::new(MeetingBotLinkRepository::claimed_bot_ids(&conn)?)
        };

        let items = events
            .into_iter()
            .map(|e| (format!("event {}", e.id), e))
            .collect();

        let reconciler = self.clone();
        let dispatched = fan_out("dispatch", items, self.settings.max_concurrency, move |event| {
            let reconciler = reconciler.clone();
            let bots = bots.clone();
            let claimed = claimed.clone();
            async move {
                let lead_time = reconciler.settings.lead_time;
                let outcome = match select_candidate(&event, &bots, &claimed, lead_time) {
                    Some(bot) => reconciler.link_bot(&event, bot, LinkOrigin::Discovered).await?,
                    None => reconciler.create_guarded(&event).await?,
                };
                Ok::<_, SyncError>(if outcome.is_noop() {
                    ItemOutcome::Skipped
                } else {
                    ItemOutcome::Processed
                })
            }
        })
        .await;

        report.merge(dispatched);
        Ok(report)
    }

    /// Withdraw every event whose dispatch flag was cleared while its meeting
    /// is still `scheduled`.
    pub async fn cancel_withdrawn(&self) -> Result<BatchReport, SyncError> {
        let events = {
            let conn = self.store.lock().await;
            CalendarEventRepository::withdrawn_with_scheduled_meeting(&conn)?
        };

        let items = events
            .into_iter()
            .map(|e| (format!("event {}", e.id), e.id))
            .collect();

        let reconciler = self.clone();
        Ok(fan_out("withdraw", items, self.settings.max_concurrency, move |event_id: String| {
            let reconciler = reconciler.clone();
            async move {
                Ok::<_, SyncError>(match reconciler.withdraw_dispatch(&event_id).await? {
                    WithdrawOutcome::Cancelled { .. } => ItemOutcome::Processed,
                    _ => ItemOutcome::Skipped,
                })
            }
        })
        .await)
    }
}

enum Reservation {
    Reserved(i64),
    Existing(i64),
}

enum Attach {
    Attached,
    /// The bot id already belongs to another meeting.
    BotClaimed,
    /// The reservation was cancelled, released or given another bot.
    Superseded(DispatchOutcome),
}

fn attach_in_transaction(
    conn: &Connection,
    meeting_id: i64,
    bot_id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Attach> {
    if MeetingRepository::attach_bot(conn, meeting_id, bot_id, now)? {
        MeetingBotLinkRepository::record(conn, meeting_id, bot_id, LinkOrigin::Dispatched, now)?;
        return Ok(Attach::Attached);
    }

    Ok(match MeetingRepository::get(conn, meeting_id)? {
        // Discovery saw the new bot first and linked it here.
        Some(meeting) if meeting.bot_id.as_deref() == Some(bot_id) => Attach::Attached,
        Some(meeting) if meeting.status == MeetingStatus::Cancelled => Attach::Superseded(
            DispatchOutcome::not_eligible("dispatch withdrawn while the bot was created"),
        ),
        Some(meeting) => Attach::Superseded(DispatchOutcome::AlreadySatisfied {
            meeting_id: meeting.id,
        }),
        None => Attach::Superseded(DispatchOutcome::not_eligible(
            "reservation released before the bot was created",
        )),
    })
}

fn link_in_transaction(
    conn: &Connection,
    event: &CalendarEvent,
    bot: &BotRecord,
    target: MeetingStatus,
    origin: LinkOrigin,
    now: DateTime<Utc>,
) -> anyhow::Result<DispatchOutcome> {
    let derived = bot.derived();

    let meeting_id =
        match MeetingRepository::find_active_for_event(conn, &event.account_id, &event.id)? {
            Some(existing) if existing.bot_id.is_some() => {
                return Ok(DispatchOutcome::AlreadySatisfied {
                    meeting_id: existing.id,
                });
            }
            Some(existing) => {
                if !MeetingRepository::attach_bot(conn, existing.id, &bot.id, now)? {
                    return Ok(DispatchOutcome::AlreadySatisfied {
                        meeting_id: existing.id,
                    });
                }
                if existing.status != target && existing.status.can_advance_to(target) {
                    MeetingRepository::transition(conn, existing.id, existing.status, target, now)?;
                }
                existing.id
            }
            None => MeetingRepository::insert(
                conn,
                &NewMeeting {
                    account_id: &event.account_id,
                    calendar_event_id: &event.id,
                    bot_id: Some(&bot.id),
                    status: target,
                    platform: match bot.platform {
                        Platform::Other => event.platform,
                        platform => platform,
                    },
                },
                now,
            )?,
        };

    MeetingRepository::set_times(conn, meeting_id, derived.started_at, derived.ended_at)?;
    crate::db::BotRecordRepository::replace(conn, bot, now)?;
    MeetingBotLinkRepository::record(conn, meeting_id, &bot.id, origin, now)?;

    let status = MeetingRepository::get(conn, meeting_id)?
        .map(|m| m.status)
        .unwrap_or(target);

    Ok(DispatchOutcome::Linked {
        meeting_id,
        bot_id: bot.id.clone(),
        status,
    })
}
