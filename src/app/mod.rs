use anyhow::{bail, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiServer, ApiState};
use crate::automation::AutomationRunner;
use crate::bots::{BotDirectory, HttpBotDirectory, MemoryBotDirectory};
use crate::calendar::{CalendarSync, CommandCalendarSource};
use crate::config::Config;
use crate::db::{AccountRepository, Store};
use crate::queue::JobQueue;
use crate::reconcile::{Reconciler, ReconcilerSettings};
use crate::scheduler::{run_tick, BatchReport, Scheduler, Task, TaskRunner, TaskStatusHandle};
use crate::transcript::{AutomationDispatch, TranscriptPipeline};

const QUEUE_CAPACITY: usize = 256;
const AUTOMATION_CONCURRENCY: usize = 2;

/// Everything the scheduler, API and CLI commands share.
pub struct Services {
    pub config: Config,
    pub store: Store,
    pub reconciler: Reconciler,
    pub calendar: Option<CalendarSync>,
    workers: Vec<JoinHandle<()>>,
}

impl Services {
    pub async fn build(config: Config) -> Result<Self> {
        let store = Store::open(&config.database_path()?)?;
        {
            let conn = store.lock().await;
            for account in &config.calendar.accounts {
                AccountRepository::ensure(&conn, account, Utc::now())?;
            }
        }

        let directory = build_directory(&config)?;

        let runner = AutomationRunner::from_configs(store.clone(), config.enabled_automations());
        let names = runner.names();
        let (automation_queue, automation_worker) = JobQueue::start(
            "automation",
            Arc::new(runner),
            QUEUE_CAPACITY,
            AUTOMATION_CONCURRENCY,
        );
        let automations = (!names.is_empty()).then(|| AutomationDispatch {
            queue: automation_queue,
            names,
        });

        let pipeline = TranscriptPipeline::new(store.clone(), directory.clone(), automations);
        let (transcript_queue, transcript_worker) = JobQueue::start(
            "transcript",
            Arc::new(pipeline),
            QUEUE_CAPACITY,
            config.schedule.max_concurrency.max(1),
        );

        let reconciler = Reconciler::new(
            store.clone(),
            directory,
            ReconcilerSettings::from_config(&config),
        )
        .with_transcript_queue(transcript_queue);

        let calendar = CommandCalendarSource::from_config(&config.calendar).map(|source| {
            CalendarSync::new(
                store.clone(),
                Arc::new(source),
                chrono::Duration::seconds(config.schedule.calendar_refresh_seconds as i64),
                config.schedule.max_concurrency.max(1),
            )
        });

        Ok(Self {
            config,
            store,
            reconciler,
            calendar,
            workers: vec![transcript_worker, automation_worker],
        })
    }

    /// Drop the queue handles and wait for queued work to finish. Every
    /// other clone of the reconciler must be gone for the workers to stop.
    pub async fn shutdown(self) {
        let Self {
            reconciler,
            calendar,
            workers,
            ..
        } = self;
        drop(reconciler);
        drop(calendar);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Queue worker panicked: {}", e);
            }
        }
    }
}

fn build_directory(config: &Config) -> Result<Arc<dyn BotDirectory>> {
    if config.bot_directory.dry_run {
        warn!("Dry run: bots are kept in memory and never join a call");
        return Ok(Arc::new(MemoryBotDirectory::new()));
    }
    if config.bot_directory.api_key.trim().is_empty() {
        bail!("No bot directory API key configured; set bot_directory.api_key or NOTETAKER_BOT_API_KEY");
    }
    Ok(Arc::new(HttpBotDirectory::new(&config.bot_directory)?))
}

pub async fn run_service(config_path: Option<&Path>) -> Result<()> {
    info!("Starting notetaker service");

    let config = Config::load(config_path)?;
    let services = Services::build(config).await?;

    let token = CancellationToken::new();
    let tasks = TaskStatusHandle::default();
    let mut scheduler = Scheduler::new(token.clone(), tasks.clone());

    for task in Task::ALL {
        let Some(period) = task.period(&services.config.schedule) else {
            info!("Task {} is disabled", task);
            continue;
        };
        if task == Task::Calendar && services.calendar.is_none() {
            info!("No calendar command configured; calendar refresh is off");
            continue;
        }
        let runner = TaskRunner::new(task, services.reconciler.clone(), services.calendar.clone());
        scheduler.spawn(task.as_str(), period, Arc::new(runner));
    }

    let api = services.config.api.enabled.then(|| {
        let server = ApiServer::new(
            services.config.api.port,
            ApiState {
                reconciler: services.reconciler.clone(),
                tasks: tasks.clone(),
            },
        );
        let shutdown = token.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(async move { shutdown.cancelled().await }).await {
                error!("API server failed: {}", e);
            }
        })
    });

    info!("Notetaker is ready!");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    token.cancel();

    scheduler.join().await;
    if let Some(api) = api {
        if let Err(e) = api.await {
            error!("API server task panicked: {}", e);
        }
    }
    services.shutdown().await;

    info!("Stopped");
    Ok(())
}

/// Run one tick of `task`, then wait for the work it queued.
pub async fn run_once(config_path: Option<&Path>, task: Task) -> Result<BatchReport> {
    let config = Config::load(config_path)?;
    let services = Services::build(config).await?;

    let runner = TaskRunner::new(task, services.reconciler.clone(), services.calendar.clone());
    let result = run_tick(task.as_str(), &runner, &TaskStatusHandle::default()).await;
    drop(runner);
    services.shutdown().await;

    result.map_err(|message| anyhow::anyhow!("Task {} failed: {}", task, message))
}
