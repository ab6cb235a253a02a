//! End-to-end reconciliation against the in-memory bot directory.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use notetaker::bots::{BotDirectory, BotRecord, CreateBotRequest, MemoryBotDirectory, Recording};
use notetaker::db::{
    AccountRepository, CalendarEventRepository, EventUpsert, LinkOrigin, Meeting,
    MeetingBotLinkRepository, MeetingFilter, MeetingRepository, NewMeeting, Store,
    TranscriptRepository,
};
use notetaker::error::SyncError;
use notetaker::meeting::MeetingStatus;
use notetaker::queue::JobQueue;
use notetaker::reconcile::{DispatchOutcome, Reconciler, ReconcilerSettings, WithdrawOutcome};
use notetaker::transcript::TranscriptPipeline;
use notetaker::urls::Platform;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const ZOOM: &str = "https://zoom.us/j/1234567890?pwd=abc";
const TRANSCRIPT: &str = r#"[
    {"participant": {"name": "Alice"}, "words": [{"text": "Hello"}, {"text": "team"}]},
    {"participant": {"name": "Bob"}, "words": [{"text": "Hi"}]}
]"#;

struct Harness {
    store: Store,
    directory: MemoryBotDirectory,
    reconciler: Reconciler,
    worker: JoinHandle<()>,
}

impl Harness {
    async fn new() -> Self {
        let directory = MemoryBotDirectory::new();
        Self::with_directory(directory.clone(), Arc::new(directory)).await
    }

    async fn with_directory(directory: MemoryBotDirectory, client: Arc<dyn BotDirectory>) -> Self {
        let store = Store::open_in_memory().unwrap();
        {
            let conn = store.lock().await;
            AccountRepository::ensure(&conn, "acct", Utc::now()).unwrap();
        }

        let pipeline = TranscriptPipeline::new(store.clone(), client.clone(), None);
        let (queue, worker) = JobQueue::start("transcript", Arc::new(pipeline), 16, 2);
        let reconciler = Reconciler::new(store.clone(), client, ReconcilerSettings::default())
            .with_transcript_queue(queue);

        Self {
            store,
            directory,
            reconciler,
            worker,
        }
    }

    async fn add_event(&self, id: &str, join_url: &str, starts_at: DateTime<Utc>, requested: bool) {
        let conn = self.store.lock().await;
        CalendarEventRepository::upsert(
            &conn,
            &EventUpsert {
                id: id.to_string(),
                account_id: "acct".to_string(),
                join_url: Some(join_url.to_string()),
                platform: Platform::detect(join_url),
                starts_at,
                ends_at: starts_at + Duration::hours(1),
                dispatch_requested: Some(requested),
            },
            Utc::now(),
        )
        .unwrap();
    }

    async fn meetings(&self) -> Vec<Meeting> {
        let conn = self.store.lock().await;
        MeetingRepository::list(&conn, &MeetingFilter::default()).unwrap()
    }

    async fn meeting(&self, id: i64) -> Meeting {
        let conn = self.store.lock().await;
        MeetingRepository::get(&conn, id).unwrap().unwrap()
    }

    async fn wait_for(&self, id: i64, status: MeetingStatus) -> Meeting {
        for _ in 0..100 {
            let meeting = self.meeting(id).await;
            if meeting.status == status {
                return meeting;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("meeting {id} never reached {status}");
    }

    /// Drop the queue handle and wait for queued transcript jobs to finish.
    async fn finish(self) {
        drop(self.reconciler);
        self.worker.await.unwrap();
    }

    fn complete_bot(&self, bot_id: &str, started: DateTime<Utc>) {
        self.directory.push_status(bot_id, "call_ended", started + Duration::minutes(30));
        self.directory.push_status(bot_id, "done", started + Duration::minutes(31));
        self.directory.add_recording(
            bot_id,
            Recording {
                id: format!("rec-{bot_id}"),
                status: "done".into(),
                transcript_id: Some(format!("tr-{bot_id}")),
                transcript_status: Some("done".into()),
                ..Default::default()
            },
        );
        self.directory.set_transcript(&format!("tr-{bot_id}"), TRANSCRIPT);
    }
}

#[tokio::test]
async fn test_dispatched_meeting_runs_to_ready() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.add_event("evt", ZOOM, now + Duration::minutes(5), true).await;

    let report = h.reconciler.dispatch_due(now).await.unwrap();
    assert_eq!(report.processed, 1);
    let meeting = h.meetings().await.remove(0);
    assert_eq!(meeting.status, MeetingStatus::Scheduled);
    let bot_id = meeting.bot_id.clone().unwrap();

    let started = now + Duration::minutes(5);
    h.directory.push_status(&bot_id, "joining_call", started);
    h.directory.push_status(&bot_id, "in_call_recording", started + Duration::minutes(1));
    h.reconciler.poll_active().await.unwrap();
    assert_eq!(h.meeting(meeting.id).await.status, MeetingStatus::Recording);

    h.complete_bot(&bot_id, started);
    h.reconciler.poll_active().await.unwrap();

    let ready = h.wait_for(meeting.id, MeetingStatus::Ready).await;
    assert!(ready.started_at.is_some());
    assert!(ready.ended_at.is_some());
    {
        let conn = h.store.lock().await;
        let transcript = TranscriptRepository::get(&conn, meeting.id).unwrap().unwrap();
        assert!(transcript.text.starts_with("Alice: Hello team"));
        assert!(transcript.text.contains("Bob: Hi"));
        assert_eq!(transcript.bot_id, bot_id);
    }

    // Nothing left to poll once the meeting is ready.
    assert_eq!(h.reconciler.poll_active().await.unwrap().total(), 0);
    assert_eq!(h.directory.create_calls(), 1);
    h.finish().await;
}

#[tokio::test]
async fn test_orphaned_bot_is_linked_instead_of_duplicated() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.add_event("evt", ZOOM, now + Duration::minutes(5), true).await;

    // Created by an earlier run that crashed before recording the meeting.
    h.directory.seed_bot("orphan", "https://us02web.zoom.us/j/1234567890?pwd=abc");
    h.directory.push_status("orphan", "joining_call", now);

    let report = h.reconciler.dispatch_due(now).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(h.directory.create_calls(), 0);

    let meetings = h.meetings().await;
    assert_eq!(meetings.len(), 1);
    assert_eq!(meetings[0].bot_id.as_deref(), Some("orphan"));
    {
        let conn = h.store.lock().await;
        let links = MeetingBotLinkRepository::for_meeting(&conn, meetings[0].id).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].origin, LinkOrigin::Discovered);
    }

    // Later ticks keep the single meeting.
    h.reconciler.dispatch_due(now).await.unwrap();
    h.reconciler.discover(now).await.unwrap();
    assert_eq!(h.meetings().await.len(), 1);
    assert_eq!(h.directory.create_calls(), 0);
    h.finish().await;
}

#[tokio::test]
async fn test_concurrent_dispatch_creates_one_bot() {
    let h = Harness::new().await;
    h.add_event("evt", ZOOM, Utc::now() + Duration::minutes(5), true).await;

    let first = h.reconciler.clone();
    let second = h.reconciler.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.dispatch("evt").await }),
        tokio::spawn(async move { second.dispatch("evt").await }),
    );
    let outcomes = [a.unwrap().unwrap(), b.unwrap().unwrap()];

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Created { .. }))
        .count();
    let satisfied = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::AlreadySatisfied { .. }))
        .count();
    assert_eq!((created, satisfied), (1, 1));
    assert_eq!(h.directory.create_calls(), 1);
    assert_eq!(h.meetings().await.len(), 1);
    h.finish().await;
}

/// Always reports the same bot id, as a directory would when two creates
/// collapse into one bot.
struct FixedIdDirectory {
    inner: MemoryBotDirectory,
    bot_id: String,
}

#[async_trait]
impl BotDirectory for FixedIdDirectory {
    async fn create_bot(&self, request: &CreateBotRequest) -> Result<String, SyncError> {
        self.inner.create_bot(request).await?;
        Ok(self.bot_id.clone())
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotRecord, SyncError> {
        self.inner.get_bot(bot_id).await
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>, SyncError> {
        self.inner.list_bots().await
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<(), SyncError> {
        self.inner.delete_bot(bot_id).await
    }

    async fn recordings(&self, bot_id: &str) -> Result<Vec<Recording>, SyncError> {
        self.inner.recordings(bot_id).await
    }

    async fn transcript_download_url(&self, transcript_id: &str) -> Result<String, SyncError> {
        self.inner.transcript_download_url(transcript_id).await
    }

    async fn download(&self, url: &str) -> Result<String, SyncError> {
        self.inner.download(url).await
    }
}

#[tokio::test]
async fn test_claimed_bot_id_yields_already_claimed() {
    let directory = MemoryBotDirectory::new();
    let client = Arc::new(FixedIdDirectory {
        inner: directory.clone(),
        bot_id: "bot-x".to_string(),
    });
    let h = Harness::with_directory(directory, client).await;
    h.add_event("other", ZOOM, Utc::now() + Duration::minutes(5), true).await;
    h.add_event("evt", "https://meet.google.com/abc-defg-hij", Utc::now() + Duration::minutes(5), true)
        .await;
    {
        let conn = h.store.lock().await;
        MeetingRepository::insert(
            &conn,
            &NewMeeting {
                account_id: "acct",
                calendar_event_id: "other",
                bot_id: Some("bot-x"),
                status: MeetingStatus::Scheduled,
                platform: Platform::Zoom,
            },
            Utc::now(),
        )
        .unwrap();
    }

    let outcome = h.reconciler.dispatch("evt").await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::AlreadyClaimed {
            bot_id: "bot-x".to_string()
        }
    );

    let conn = h.store.lock().await;
    assert!(MeetingRepository::find_active_for_event(&conn, "acct", "evt")
        .unwrap()
        .is_none());
    assert_eq!(MeetingRepository::list(&conn, &MeetingFilter::default()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_discovery_recovers_finished_meeting() {
    let h = Harness::new().await;
    let now = Utc::now();
    let started = now - Duration::hours(2);
    h.add_event("evt", ZOOM, started, true).await;

    h.directory.seed_bot("b1", ZOOM);
    h.directory.push_status("b1", "joining_call", started);
    h.complete_bot("b1", started);

    // A second bot joined the same call later and is still recording.
    h.directory.seed_bot("b2", "https://us02web.zoom.us/j/1234567890?pwd=abc");
    h.directory.push_status("b2", "joining_call", started + Duration::minutes(5));
    h.directory.push_status("b2", "in_call_recording", started + Duration::minutes(6));

    let first = h.reconciler.discover(now).await.unwrap();
    assert_eq!(first.processed, 1);
    let second = h.reconciler.discover(now).await.unwrap();
    assert_eq!(second.total(), 0);

    let meetings = h.meetings().await;
    assert_eq!(meetings.len(), 1);
    let ready = h.wait_for(meetings[0].id, MeetingStatus::Ready).await;
    assert_eq!(ready.bot_id.as_deref(), Some("b1"));
    {
        let conn = h.store.lock().await;
        let transcript = TranscriptRepository::get(&conn, ready.id).unwrap().unwrap();
        assert_eq!(transcript.bot_id, "b1");
        assert!(transcript.text.starts_with("Alice: Hello team"));
    }
    assert_eq!(h.directory.create_calls(), 0);
    h.finish().await;
}

#[tokio::test]
async fn test_withdrawn_request_is_not_redispatched() {
    let h = Harness::new().await;
    let now = Utc::now();
    h.add_event("evt", ZOOM, now + Duration::minutes(30), false).await;

    let created = h.reconciler.request_dispatch("evt").await.unwrap();
    let DispatchOutcome::Created { meeting_id, bot_id } = created else {
        panic!("expected a created bot, got {created:?}");
    };

    let withdrawn = h.reconciler.withdraw_dispatch("evt").await.unwrap();
    assert_eq!(
        withdrawn,
        WithdrawOutcome::Cancelled {
            meeting_id,
            bot_deleted: true
        }
    );
    assert!(h.directory.bot(&bot_id).is_none());

    let report = h.reconciler.dispatch_due(now + Duration::minutes(25)).await.unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(h.directory.create_calls(), 1);
    assert_eq!(h.meeting(meeting_id).await.status, MeetingStatus::Cancelled);
    h.finish().await;
}

#[tokio::test]
async fn test_bot_removed_from_directory_fails_meeting() {
    let h = Harness::new().await;
    h.add_event("evt", ZOOM, Utc::now() + Duration::minutes(5), true).await;
    let DispatchOutcome::Created { meeting_id, bot_id } = h.reconciler.dispatch("evt").await.unwrap()
    else {
        panic!("expected a created bot");
    };

    h.directory.delete_bot(&bot_id).await.unwrap();
    let report = h.reconciler.poll_active().await.unwrap();
    assert_eq!(report.processed, 1);

    let meeting = h.meeting(meeting_id).await;
    assert_eq!(meeting.status, MeetingStatus::Failed);
    assert!(meeting.error.unwrap().contains(&bot_id));
    h.finish().await;
}

/// Holds the first create open until released, like a slow directory.
struct GatedDirectory {
    inner: MemoryBotDirectory,
    gated: AtomicBool,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl GatedDirectory {
    fn new(inner: MemoryBotDirectory) -> Self {
        Self {
            inner,
            gated: AtomicBool::new(true),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl BotDirectory for GatedDirectory {
    async fn create_bot(&self, request: &CreateBotRequest) -> Result<String, SyncError> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.create_bot(request).await
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotRecord, SyncError> {
        self.inner.get_bot(bot_id).await
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>, SyncError> {
        self.inner.list_bots().await
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<(), SyncError> {
        self.inner.delete_bot(bot_id).await
    }

    async fn recordings(&self, bot_id: &str) -> Result<Vec<Recording>, SyncError> {
        self.inner.recordings(bot_id).await
    }

    async fn transcript_download_url(&self, transcript_id: &str) -> Result<String, SyncError> {
        self.inner.transcript_download_url(transcript_id).await
    }

    async fn download(&self, url: &str) -> Result<String, SyncError> {
        self.inner.download(url).await
    }
}

async fn gated_harness() -> (Harness, Arc<Notify>, Arc<Notify>) {
    let directory = MemoryBotDirectory::new();
    let gated = Arc::new(GatedDirectory::new(directory.clone()));
    let (entered, release) = (gated.entered.clone(), gated.release.clone());
    (Harness::with_directory(directory, gated).await, entered, release)
}

#[tokio::test]
async fn test_pending_create_does_not_block_other_work() {
    let (h, entered, release) = gated_harness().await;
    let now = Utc::now();
    h.add_event("a", ZOOM, now + Duration::minutes(5), true).await;
    h.add_event("b", "https://meet.google.com/abc-defg-hij", now + Duration::minutes(5), true)
        .await;

    let pending = {
        let reconciler = h.reconciler.clone();
        tokio::spawn(async move { reconciler.dispatch("a").await })
    };
    entered.notified().await;

    let limit = std::time::Duration::from_secs(1);
    let meetings = tokio::time::timeout(limit, h.meetings())
        .await
        .expect("store read waited on the pending create");
    assert_eq!(meetings.len(), 1);
    assert_eq!(meetings[0].calendar_event_id, "a");
    assert_eq!(meetings[0].status, MeetingStatus::Scheduled);
    assert!(meetings[0].bot_id.is_none());

    let other = tokio::time::timeout(limit, h.reconciler.dispatch("b"))
        .await
        .expect("dispatch of another event waited on the pending create")
        .unwrap();
    assert!(matches!(other, DispatchOutcome::Created { .. }));

    // The reservation already answers a second attempt for the same event.
    assert!(matches!(
        h.reconciler.dispatch("a").await.unwrap(),
        DispatchOutcome::AlreadySatisfied { .. }
    ));

    release.notify_one();
    let DispatchOutcome::Created { meeting_id, bot_id } = pending.await.unwrap().unwrap() else {
        panic!("pending dispatch did not create");
    };
    assert_eq!(h.meeting(meeting_id).await.bot_id.as_deref(), Some(bot_id.as_str()));
    assert_eq!(h.directory.create_calls(), 2);
    {
        let conn = h.store.lock().await;
        let links = MeetingBotLinkRepository::for_meeting(&conn, meeting_id).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].origin, LinkOrigin::Dispatched);
    }
    h.finish().await;
}

#[tokio::test]
async fn test_withdraw_during_create_removes_new_bot() {
    let (h, entered, release) = gated_harness().await;
    h.add_event("evt", ZOOM, Utc::now() + Duration::minutes(30), true).await;

    let pending = {
        let reconciler = h.reconciler.clone();
        tokio::spawn(async move { reconciler.dispatch("evt").await })
    };
    entered.notified().await;

    let withdrawn = h.reconciler.withdraw_dispatch("evt").await.unwrap();
    let WithdrawOutcome::Cancelled {
        meeting_id,
        bot_deleted: false,
    } = withdrawn
    else {
        panic!("unexpected withdraw outcome {withdrawn:?}");
    };

    release.notify_one();
    let outcome = pending.await.unwrap().unwrap();
    assert!(matches!(outcome, DispatchOutcome::NotEligible { .. }), "{outcome:?}");

    assert_eq!(h.directory.create_calls(), 1);
    assert_eq!(h.directory.bot_count(), 0);
    let meeting = h.meeting(meeting_id).await;
    assert_eq!(meeting.status, MeetingStatus::Cancelled);
    assert!(meeting.bot_id.is_none());
    h.finish().await;
}

#[tokio::test]
async fn test_flag_cleared_by_calendar_cancels_scheduled_meeting() {
    let h = Harness::new().await;
    let now = Utc::now();
    let starts_at = now + Duration::minutes(30);
    h.add_event("evt", ZOOM, starts_at, true).await;

    let DispatchOutcome::Created { meeting_id, bot_id } = h.reconciler.dispatch("evt").await.unwrap()
    else {
        panic!("expected a created bot");
    };

    // The calendar now reports the event without a dispatch request.
    h.add_event("evt", ZOOM, starts_at, false).await;

    let report = h.reconciler.dispatch_due(now).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(h.meeting(meeting_id).await.status, MeetingStatus::Cancelled);
    assert!(h.directory.bot(&bot_id).is_none());

    // Nothing brings the bot back.
    assert_eq!(h.reconciler.dispatch_due(now).await.unwrap().total(), 0);
    assert_eq!(h.reconciler.discover(now).await.unwrap().total(), 0);
    assert_eq!(h.reconciler.poll_active().await.unwrap().total(), 0);
    assert_eq!(h.directory.create_calls(), 1);
    h.finish().await;
}
