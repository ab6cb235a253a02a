//! Recurring control loop.
//!
//! Each task runs on its own interval. A tick is spawned rather than awaited
//! in place, so a tick that overruns its interval overlaps with the next one
//! instead of delaying it.

pub mod batch;
pub mod status;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calendar::CalendarSync;
use crate::config::ScheduleConfig;
use crate::reconcile::Reconciler;

pub use batch::{fan_out, BatchReport, ItemOutcome};
pub use status::{TaskState, TaskStatusHandle};

/// The recurring tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Task {
    /// Poll bots of scheduled and recording meetings.
    Poll,
    /// Dispatch bots for flagged events inside the lead time.
    Dispatch,
    /// Link existing bots to events missing one.
    Discover,
    /// Queue transcript fetches for processing meetings.
    Transcripts,
    /// Refresh calendar events of pending accounts.
    Calendar,
}

impl Task {
    pub const ALL: [Task; 5] = [
        Task::Poll,
        Task::Dispatch,
        Task::Discover,
        Task::Transcripts,
        Task::Calendar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Poll => "poll",
            Task::Dispatch => "dispatch",
            Task::Discover => "discover",
            Task::Transcripts => "transcripts",
            Task::Calendar => "calendar",
        }
    }

    /// Configured period, or `None` when the task is switched off.
    pub fn period(&self, schedule: &ScheduleConfig) -> Option<Duration> {
        let seconds = match self {
            Task::Poll => schedule.bot_poll_seconds,
            Task::Dispatch => schedule.dispatch_seconds,
            Task::Discover if !schedule.discovery_enabled => return None,
            Task::Discover => schedule.discovery_seconds,
            Task::Transcripts => schedule.transcript_sweep_seconds,
            Task::Calendar => schedule.calendar_refresh_seconds,
        };
        (seconds > 0).then(|| Duration::from_secs(seconds))
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run of a recurring task.
#[async_trait]
pub trait Tick: Send + Sync + 'static {
    async fn tick(&self) -> Result<BatchReport>;
}

/// Runs a [`Task`] against the reconciler or the calendar sync.
pub struct TaskRunner {
    task: Task,
    reconciler: Reconciler,
    calendar: Option<CalendarSync>,
}

impl TaskRunner {
    pub fn new(task: Task, reconciler: Reconciler, calendar: Option<CalendarSync>) -> Self {
        Self {
            task,
            reconciler,
            calendar,
        }
    }
}

#[async_trait]
impl Tick for TaskRunner {
    async fn tick(&self) -> Result<BatchReport> {
        let now = Utc::now();
        let report = match self.task {
            Task::Poll => self.reconciler.poll_active().await?,
            Task::Dispatch => self.reconciler.dispatch_due(now).await?,
            Task::Discover => self.reconciler.discover(now).await?,
            Task::Transcripts => self.reconciler.sweep_transcripts().await?,
            Task::Calendar => match &self.calendar {
                Some(calendar) => {
                    let mut report = calendar.refresh(now).await?;
                    // A refresh may clear dispatch flags.
                    report.merge(self.reconciler.cancel_withdrawn().await?);
                    report
                }
                None => {
                    debug!("No calendar source configured");
                    BatchReport::default()
                }
            },
        };
        Ok(report)
    }
}

pub struct Scheduler {
    token: CancellationToken,
    status: TaskStatusHandle,
    loops: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(token: CancellationToken, status: TaskStatusHandle) -> Self {
        Self {
            token,
            status,
            loops: Vec::new(),
        }
    }

    pub fn status(&self) -> TaskStatusHandle {
        self.status.clone()
    }

    /// Start running `tick` every `period`; the first tick fires at once.
    pub fn spawn(&mut self, name: &'static str, period: Duration, tick: Arc<dyn Tick>) {
        info!("Scheduling {} every {}s", name, period.as_secs());
        self.loops.push(tokio::spawn(run_recurring(
            name,
            period,
            tick,
            self.token.clone(),
            self.status.clone(),
        )));
    }

    /// Wait for every loop to stop. Loops stop once the token is cancelled
    /// and their in-flight ticks have finished.
    pub async fn join(self) {
        for handle in self.loops {
            if let Err(e) = handle.await {
                error!("Scheduler loop panicked: {}", e);
            }
        }
    }
}

async fn run_recurring(
    name: &'static str,
    period: Duration,
    tick: Arc<dyn Tick>,
    token: CancellationToken,
    status: TaskStatusHandle,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let tick = tick.clone();
                let status = status.clone();
                running.spawn(async move { run_tick(name, tick.as_ref(), &status).await });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!(task = name, "Tick panicked: {}", e);
                }
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!(task = name, "Tick panicked: {}", e);
        }
    }
    debug!(task = name, "Scheduler loop stopped");
}

/// Run one tick and record its outcome.
pub async fn run_tick(name: &'static str, tick: &dyn Tick, status: &TaskStatusHandle) -> Result<BatchReport, String> {
    status.started(name).await;
    let result = tick.tick().await;
    match &result {
        Ok(report) if report.failed > 0 => warn!(task = name, "Tick finished: {}", report),
        Ok(report) if report.total() > 0 => info!(task = name, "Tick finished: {}", report),
        Ok(_) => debug!(task = name, "Tick finished with nothing to do"),
        Err(e) => warn!(task = name, "Tick failed: {:#}", e),
    }
    let result = result.map_err(|e| format!("{e:#}"));
    status.finished(name, &result).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{CalendarSource, ExternalEvent};
    use crate::db::{AccountRepository, MeetingRepository};
    use crate::error::SyncError;
    use crate::meeting::MeetingStatus;
    use crate::reconcile::test_support::{add_event, reconciler};
    use crate::reconcile::DispatchOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        ticks: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Tick for Counting {
        async fn tick(&self) -> Result<BatchReport> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("directory unreachable");
            }
            Ok(BatchReport {
                processed: 1,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_periods_follow_config() {
        let mut schedule = ScheduleConfig::default();
        assert_eq!(Task::Poll.period(&schedule), Some(Duration::from_secs(120)));
        assert_eq!(Task::Calendar.period(&schedule), Some(Duration::from_secs(1800)));

        schedule.discovery_enabled = false;
        schedule.transcript_sweep_seconds = 0;
        assert_eq!(Task::Discover.period(&schedule), None);
        assert_eq!(Task::Transcripts.period(&schedule), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_repeat_until_cancelled() {
        let token = CancellationToken::new();
        let status = TaskStatusHandle::default();
        let mut scheduler = Scheduler::new(token.clone(), status.clone());
        let counting = Arc::new(Counting {
            ticks: AtomicUsize::new(0),
            fail: false,
        });

        scheduler.spawn("count", Duration::from_secs(10), counting.clone());
        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        scheduler.join().await;

        assert_eq!(counting.ticks.load(Ordering::SeqCst), 3);
        let state = status.get("count").await.unwrap();
        assert_eq!(state.runs, 3);
        assert_eq!(state.running, 0);
        assert_eq!(state.last_report.map(|r| r.processed), Some(1));
    }

    #[tokio::test]
    async fn test_failed_tick_is_recorded() {
        let status = TaskStatusHandle::default();
        let failing = Counting {
            ticks: AtomicUsize::new(0),
            fail: true,
        };

        let result = run_tick("failing", &failing, &status).await;
        assert!(result.is_err());

        let state = status.get("failing").await.unwrap();
        assert_eq!(state.last_error.as_deref(), Some("directory unreachable"));
        assert!(state.last_report.is_none());
    }

    struct ClearedFlag {
        starts_at: chrono::DateTime<Utc>,
    }

    #[async_trait]
    impl CalendarSource for ClearedFlag {
        async fn fetch_events(&self, _account_id: &str) -> Result<Vec<ExternalEvent>, SyncError> {
            Ok(vec![ExternalEvent {
                id: "evt".to_string(),
                join_url: Some(URL.to_string()),
                platform: None,
                starts_at: self.starts_at,
                ends_at: self.starts_at + chrono::Duration::hours(1),
                dispatch_requested: Some(false),
            }])
        }
    }

    const URL: &str = "https://zoom.us/j/1234567890?pwd=abc";

    #[tokio::test]
    async fn test_calendar_tick_cancels_cleared_dispatch() {
        let (reconciler, directory) = reconciler().await;
        let starts_at = Utc::now() + chrono::Duration::hours(2);
        add_event(&reconciler, "evt", Some(URL), starts_at, true).await;
        {
            let conn = reconciler.store().lock().await;
            AccountRepository::ensure(&conn, "acct", Utc::now()).unwrap();
        }
        let DispatchOutcome::Created { meeting_id, bot_id } =
            reconciler.dispatch("evt").await.unwrap()
        else {
            panic!("dispatch did not create");
        };

        let calendar = CalendarSync::new(
            reconciler.store().clone(),
            Arc::new(ClearedFlag { starts_at }),
            chrono::Duration::minutes(30),
            2,
        );
        let runner = TaskRunner::new(Task::Calendar, reconciler.clone(), Some(calendar));
        let report = runner.tick().await.unwrap();

        // One account synced, one meeting cancelled.
        assert_eq!(report.processed, 2);
        assert!(directory.bot(&bot_id).is_none());
        let conn = reconciler.store().lock().await;
        assert_eq!(
            MeetingRepository::get(&conn, meeting_id).unwrap().unwrap().status,
            MeetingStatus::Cancelled
        );
    }
}
