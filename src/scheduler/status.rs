use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::BatchReport;

/// Last known state of one recurring task.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TaskState {
    /// Ticks started since the process came up.
    pub runs: u64,
    /// Ticks currently in flight.
    pub running: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_report: Option<BatchReport>,
    pub last_error: Option<String>,
}

/// Thread-safe handle for sharing task state between the scheduler and API handlers.
#[derive(Clone, Default)]
pub struct TaskStatusHandle {
    inner: Arc<Mutex<BTreeMap<&'static str, TaskState>>>,
}

impl TaskStatusHandle {
    pub async fn get(&self, task: &str) -> Option<TaskState> {
        self.inner.lock().await.get(task).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<&'static str, TaskState> {
        self.inner.lock().await.clone()
    }

    pub async fn started(&self, task: &'static str) {
        let mut tasks = self.inner.lock().await;
        let state = tasks.entry(task).or_default();
        state.runs += 1;
        state.running += 1;
        state.last_started = Some(Utc::now());
    }

    pub async fn finished(&self, task: &'static str, result: &Result<BatchReport, String>) {
        let mut tasks = self.inner.lock().await;
        let state = tasks.entry(task).or_default();
        state.running = state.running.saturating_sub(1);
        state.last_finished = Some(Utc::now());
        match result {
            Ok(report) => {
                state.last_report = Some(*report);
                state.last_error = None;
            }
            Err(message) => state.last_error = Some(message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_task_has_no_state() {
        let handle = TaskStatusHandle::default();
        assert!(handle.get("poll").await.is_none());
        assert!(handle.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_keeps_previous_report() {
        let handle = TaskStatusHandle::default();
        let report = BatchReport {
            processed: 2,
            ..Default::default()
        };

        handle.started("poll").await;
        assert_eq!(handle.get("poll").await.unwrap().running, 1);
        handle.finished("poll", &Ok(report)).await;

        handle.started("poll").await;
        handle.finished("poll", &Err("timeout".to_string())).await;

        let state = handle.get("poll").await.unwrap();
        assert_eq!(state.runs, 2);
        assert_eq!(state.running, 0);
        assert_eq!(state.last_report, Some(report));
        assert_eq!(state.last_error.as_deref(), Some("timeout"));

        handle.started("poll").await;
        handle.finished("poll", &Ok(BatchReport::default())).await;
        assert!(handle.get("poll").await.unwrap().last_error.is_none());
    }
}
