//! Content-generation automations run once a meeting's transcript is ready.
//!
//! An automation receives the transcript on stdin plus meeting metadata in its
//! environment (e.g. to generate minutes or file notes elsewhere). Runs are
//! queued per automation and recorded in `automation_runs`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AutomationConfig;
use crate::db::{AutomationRunRepository, RunStatus, Store};
use crate::queue::{Job, JobHandler};

/// Environment variable names for meeting metadata passed to automations.
pub mod automation_env {
    pub const MEETING_ID: &str = "NOTETAKER_MEETING_ID";
    pub const BOT_ID: &str = "NOTETAKER_BOT_ID";
    pub const ACCOUNT_ID: &str = "NOTETAKER_ACCOUNT_ID";
    pub const EVENT_ID: &str = "NOTETAKER_EVENT_ID";
    pub const AUTOMATION: &str = "NOTETAKER_AUTOMATION";
}

/// What an automation gets to work with.
#[derive(Debug, Clone)]
pub struct AutomationInput {
    pub meeting_id: i64,
    pub bot_id: String,
    pub account_id: String,
    pub calendar_event_id: String,
    pub transcript_text: String,
}

#[async_trait]
pub trait Automation: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, input: &AutomationInput) -> Result<()>;
}

/// Runs a shell command.
/// - Pipes the transcript to stdin
/// - Sets environment variables for meeting metadata
/// - Kills the process on timeout
/// - Non-zero exit fails the run
pub struct ShellAutomation {
    name: String,
    command: String,
    timeout: Duration,
}

impl ShellAutomation {
    pub fn new(name: impl Into<String>, command: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: Duration::from_secs(timeout_seconds.max(1)),
        }
    }

    pub fn from_config(config: &AutomationConfig) -> Self {
        Self::new(&config.name, &config.command, config.timeout_seconds)
    }
}

#[async_trait]
impl Automation for ShellAutomation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &AutomationInput) -> Result<()> {
        info!(
            "Running automation {} for meeting {}: {}",
            self.name, input.meeting_id, self.command
        );

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(automation_env::MEETING_ID, input.meeting_id.to_string())
            .env(automation_env::BOT_ID, &input.bot_id)
            .env(automation_env::ACCOUNT_ID, &input.account_id)
            .env(automation_env::EVENT_ID, &input.calendar_event_id)
            .env(automation_env::AUTOMATION, &self.name)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn automation {}", self.name))?;

        // Write transcript to stdin; dropping it signals EOF
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            // A command that ignores stdin may close it early.
            let _ = stdin.write_all(input.transcript_text.as_bytes()).await;
        }

        // kill_on_drop handles cleanup on timeout
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.with_context(|| format!("Automation {} failed to run", self.name))?,
            Err(_) => anyhow::bail!(
                "Automation {} timed out after {}s",
                self.name,
                self.timeout.as_secs()
            ),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            info!("Automation {} stdout: {}", self.name, stdout.trim());
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Automation {} exited with status {}: {}",
                self.name,
                output.status,
                stderr.trim()
            );
        }

        Ok(())
    }
}

/// One queued automation run.
#[derive(Debug, Clone)]
pub struct AutomationJob {
    pub run_id: i64,
    pub automation: String,
    pub input: AutomationInput,
}

impl Job for AutomationJob {
    fn key(&self) -> String {
        format!("{}:{}", self.input.meeting_id, self.automation)
    }
}

/// Executes queued automation runs and records their outcome.
pub struct AutomationRunner {
    automations: HashMap<String, Arc<dyn Automation>>,
    store: Store,
}

impl AutomationRunner {
    pub fn new(store: Store, automations: Vec<Arc<dyn Automation>>) -> Self {
        Self {
            automations: automations
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
            store,
        }
    }

    pub fn from_configs<'a>(
        store: Store,
        configs: impl IntoIterator<Item = &'a AutomationConfig>,
    ) -> Self {
        let automations = configs
            .into_iter()
            .map(|c| Arc::new(ShellAutomation::from_config(c)) as Arc<dyn Automation>)
            .collect();
        Self::new(store, automations)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.automations.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl JobHandler<AutomationJob> for AutomationRunner {
    type Output = RunStatus;

    async fn handle(&self, job: AutomationJob) -> Result<RunStatus> {
        let outcome = match self.automations.get(&job.automation) {
            Some(automation) => automation.run(&job.input).await,
            None => Err(anyhow::anyhow!("Unknown automation {}", job.automation)),
        };

        let (status, error) = match &outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(e) => {
                warn!(
                    "Automation {} failed for meeting {}: {:#}",
                    job.automation, job.input.meeting_id, e
                );
                (RunStatus::Failed, Some(format!("{e:#}")))
            }
        };

        let conn = self.store.lock().await;
        AutomationRunRepository::finish(&conn, job.run_id, status, error.as_deref(), Utc::now())?;

        outcome.map(|()| status)
    }
}
