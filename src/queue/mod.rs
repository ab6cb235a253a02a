//! Bounded job queue with observable completion.
//!
//! Work triggered by the reconciler (transcript fetches, automations) is
//! handed to a worker through a bounded channel instead of being spawned and
//! forgotten. Every outcome is logged by the worker; callers that care can
//! await the returned [`JobTicket`].

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// A unit of queued work.
pub trait Job: Send + 'static {
    /// Jobs with equal keys are not queued twice while one is pending.
    fn key(&self) -> String;
}

#[async_trait]
pub trait JobHandler<J: Job>: Send + Sync + 'static {
    type Output: Debug + Send + 'static;

    async fn handle(&self, job: J) -> Result<Self::Output>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("job {0} is already queued or running")]
    Duplicate(String),
    #[error("queue is full")]
    Full,
    #[error("queue worker has stopped")]
    Closed,
}

/// Handle to the eventual outcome of a queued job.
pub struct JobTicket<T> {
    key: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobTicket<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("job {} was dropped before completing", self.key),
        }
    }
}

struct Envelope<J, T> {
    job: J,
    key: String,
    reply: oneshot::Sender<Result<T>>,
}

type PendingKeys = Arc<Mutex<HashSet<String>>>;

/// Removes the key from the pending set however the job ends.
struct PendingGuard {
    pending: PendingKeys,
    key: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

pub struct JobQueue<J, T> {
    name: &'static str,
    tx: mpsc::Sender<Envelope<J, T>>,
    pending: PendingKeys,
}

impl<J, T> Clone for JobQueue<J, T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<J: Job, T: Debug + Send + 'static> JobQueue<J, T> {
    /// Start a worker running `handler` with at most `concurrency` jobs in
    /// flight. The worker exits once every queue handle is dropped and the
    /// remaining jobs have finished.
    pub fn start<H>(
        name: &'static str,
        handler: Arc<H>,
        capacity: usize,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>)
    where
        H: JobHandler<J, Output = T>,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending: PendingKeys = Arc::default();
        let worker = tokio::spawn(run_worker(
            name,
            rx,
            handler,
            pending.clone(),
            concurrency.max(1),
        ));

        (Self { name, tx, pending }, worker)
    }

    pub fn enqueue(&self, job: J) -> Result<JobTicket<T>, EnqueueError> {
        let key = job.key();
        {
            let mut pending = self.pending.lock().map_err(|_| EnqueueError::Closed)?;
            if !pending.insert(key.clone()) {
                return Err(EnqueueError::Duplicate(key));
            }
        }

        let (reply, rx) = oneshot::channel();
        let envelope = Envelope {
            job,
            key: key.clone(),
            reply,
        };

        match self.tx.try_send(envelope) {
            Ok(()) => {
                debug!("Queued {} job {}", self.name, key);
                Ok(JobTicket { key, rx })
            }
            Err(err) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&key);
                }
                Err(match err {
                    mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                    mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
                })
            }
        }
    }

    /// Number of jobs queued or running.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains(key))
            .unwrap_or(false)
    }
}

async fn run_worker<J, H>(
    name: &'static str,
    mut rx: mpsc::Receiver<Envelope<J, H::Output>>,
    handler: Arc<H>,
    pending: PendingKeys,
    concurrency: usize,
) where
    J: Job,
    H: JobHandler<J>,
{
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    info!("{} worker started (concurrency {})", name, concurrency);

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(envelope) = received else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let handler = handler.clone();
                let guard = PendingGuard {
                    pending: pending.clone(),
                    key: envelope.key.clone(),
                };

                tasks.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    let Envelope { job, key, reply } = envelope;

                    let result = handler.handle(job).await;
                    match &result {
                        Ok(output) => info!("{} job {} finished: {:?}", name, key, output),
                        Err(e) => warn!("{} job {} failed: {:#}", name, key, e),
                    }
                    // The caller may not be waiting.
                    let _ = reply.send(result);
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("{} job task panicked: {}", name, e);
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("{} job task panicked: {}", name, e);
        }
    }

    info!("{} worker stopped", name);
}
