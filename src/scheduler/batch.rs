//! Per-tick fan-out over a candidate set.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::SyncError;

/// Tally of one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed, {} failed, {} skipped",
            self.processed, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed,
    Skipped,
}

/// Run `op` for every item with at most `limit` in flight.
///
/// Each item is labelled for logging. An item's error or panic is logged and
/// counted; it never aborts the rest of the batch.
pub async fn fan_out<T, F, Fut>(
    task: &'static str,
    items: Vec<(String, T)>,
    limit: usize,
    op: F,
) -> BatchReport
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<ItemOutcome, SyncError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for (label, item) in items {
        let work = op(item);
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await;
            (label, work.await)
        });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((label, Ok(ItemOutcome::Processed))) => {
                debug!(task, item = %label, "Item processed");
                report.processed += 1;
            }
            Ok((_, Ok(ItemOutcome::Skipped))) => report.skipped += 1,
            Ok((label, Err(err))) => {
                report.failed += 1;
                match &err {
                    SyncError::Parse { sample, .. } => warn!(
                        task,
                        item = %label,
                        kind = err.kind(),
                        sample = %sample,
                        "{}", err
                    ),
                    _ => warn!(task, item = %label, kind = err.kind(), "{}", err),
                }
            }
            Err(e) => {
                report.failed += 1;
                error!(task, "Batch item panicked: {}", e);
            }
        }
    }

    report
}
