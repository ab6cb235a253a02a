//! Linking bots that already exist in the directory to events missing one.
//!
//! Discovery never creates bots. It is the backstop for bots orphaned
//! between a successful create and the local commit, and for bots started
//! outside this service.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::Reconciler;
use crate::bots::{BotRecord, DerivedStatus};
use crate::db::{CalendarEvent, CalendarEventRepository, LinkOrigin, MeetingBotLinkRepository};
use crate::error::SyncError;
use crate::meeting::{status_for_bot_code, MeetingStatus};
use crate::scheduler::{fan_out, BatchReport, ItemOutcome};
use crate::urls;

/// Order candidates best first: done before anything else, then longer
/// recordings, then the most recent start. Bot id breaks remaining ties so
/// the order is stable across runs.
pub fn rank_candidates<'a>(candidates: impl IntoIterator<Item = &'a BotRecord>) -> Vec<&'a BotRecord> {
    let mut ranked: Vec<(&BotRecord, DerivedStatus)> = candidates
        .into_iter()
        .map(|bot| (bot, bot.derived()))
        .collect();

    ranked.sort_by(|(a, da), (b, db)| {
        db.is_done()
            .cmp(&da.is_done())
            .then_with(|| desc_none_last(da.recording_duration, db.recording_duration))
            .then_with(|| desc_none_last(da.started_at, db.started_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    ranked.into_iter().map(|(bot, _)| bot).collect()
}

fn desc_none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    // `None` sorts below `Some`, so a reversed comparison puts it last.
    b.cmp(&a)
}

/// The best unclaimed bot for `event`, if any.
///
/// A candidate must be joined to an equivalent URL and must not have failed.
/// Bots that finished before the event's lead window opened belong to an
/// earlier occurrence of a recurring call and are ignored.
pub fn select_candidate<'a>(
    event: &CalendarEvent,
    bots: &'a [BotRecord],
    claimed: &HashSet<String>,
    lead_time: Duration,
) -> Option<&'a BotRecord> {
    let join_url = event.join_url()?;
    let window_opens = event.starts_at - lead_time;

    let candidates = bots.iter().filter(|bot| {
        if claimed.contains(&bot.id) || !urls::equivalent(&bot.meeting_url, join_url) {
            return false;
        }
        let derived = bot.derived();
        let failed = derived
            .current
            .as_deref()
            .and_then(status_for_bot_code)
            == Some(MeetingStatus::Failed);
        !failed && !ended_before(&derived, window_opens)
    });

    rank_candidates(candidates).into_iter().next()
}

fn ended_before(derived: &DerivedStatus, at: DateTime<Utc>) -> bool {
    derived.ended_at.is_some_and(|ended| ended < at)
}

impl Reconciler {
    /// Link unclaimed bots to events that want one but have none.
    ///
    /// Covers events starting between the lookback and the lead time ahead of
    /// `now`. Running it again without external changes is a no-op.
    pub async fn discover(&self, now: DateTime<Utc>) -> Result<BatchReport, SyncError> {
        let since = now - self.settings.discovery_lookback;
        let until = now + self.settings.lead_time;

        let events = {
            let conn = self.store.lock().await;
            CalendarEventRepository::missing_bot(&conn, since, until)?
        };
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        let bots = Arc::new(self.directory.list_bots().await?);
        let claimed: Arc<HashSet<String>> = {
            let conn = self.store.lock().await;
            Arc::new(MeetingBotLinkRepository::claimed_bot_ids(&conn)?)
        };
        debug!(
            events = events.len(),
            bots = bots.len(),
            claimed = claimed.len(),
            "Discovery candidates loaded"
        );

        let items = events
            .into_iter()
            .map(|(event, _)| (format!("event {}", event.id), event))
            .collect();

        let reconciler = self.clone();
        Ok(fan_out("discover", items, self.settings.max_concurrency, move |event| {
            let reconciler = reconciler.clone();
            let bots = bots.clone();
            let claimed = claimed.clone();
            async move {
                let lead_time = reconciler.settings.lead_time;
                let Some(bot) = select_candidate(&event, &bots, &claimed, lead_time) else {
                    return Ok(ItemOutcome::Skipped);
                };
                let outcome = reconciler
                    .link_bot(&event, bot, LinkOrigin::Discovered)
                    .await?;
                Ok::<_, SyncError>(if outcome.is_noop() {
                    ItemOutcome::Skipped
                } else {
                    ItemOutcome::Processed
                })
            }
        })
        .await)
    }
}
