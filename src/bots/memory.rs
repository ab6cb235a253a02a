//! In-process bot directory.
//!
//! Backs `dry_run` mode and the test-suite. Bots live in insertion order so
//! `list_bots` is deterministic; every call is recorded for inspection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

use super::{BotDirectory, BotRecord, CreateBotRequest, Recording, StatusChange};
use crate::error::SyncError;
use crate::urls::Platform;

const TRANSCRIPT_SCHEME: &str = "memory://transcripts/";

/// A call made against the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryCall {
    Create { meeting_url: String },
    Get(String),
    List,
    Delete(String),
    Recordings(String),
    TranscriptUrl(String),
    Download(String),
}

#[derive(Default)]
struct State {
    bots: Vec<BotRecord>,
    transcripts: HashMap<String, String>,
    calls: Vec<DirectoryCall>,
    fail_next: Option<SyncError>,
}

#[derive(Clone, Default)]
pub struct MemoryBotDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryBotDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a bot.
    pub fn insert_bot(&self, bot: BotRecord) {
        let mut state = self.lock();
        match state.bots.iter_mut().find(|b| b.id == bot.id) {
            Some(existing) => *existing = bot,
            None => state.bots.push(bot),
        }
    }

    /// Add a bot with no history and return its id.
    pub fn seed_bot(&self, bot_id: &str, meeting_url: &str) -> String {
        self.insert_bot(BotRecord {
            id: bot_id.to_string(),
            meeting_url: meeting_url.to_string(),
            platform: Platform::detect(meeting_url),
            status_changes: Vec::new(),
            recordings: Vec::new(),
        });
        bot_id.to_string()
    }

    pub fn push_status(&self, bot_id: &str, code: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(bot) = state.bots.iter_mut().find(|b| b.id == bot_id) {
            bot.status_changes.push(StatusChange {
                code: code.to_string(),
                sub_code: None,
                created_at: at,
            });
        }
    }

    pub fn add_recording(&self, bot_id: &str, recording: Recording) {
        let mut state = self.lock();
        if let Some(bot) = state.bots.iter_mut().find(|b| b.id == bot_id) {
            bot.recordings.push(recording);
        }
    }

    /// Register the payload served for a transcript resource.
    pub fn set_transcript(&self, transcript_id: &str, payload: impl Into<String>) {
        self.lock()
            .transcripts
            .insert(transcript_id.to_string(), payload.into());
    }

    /// Make the next call fail with `err`.
    pub fn fail_next(&self, err: SyncError) {
        self.lock().fail_next = Some(err);
    }

    pub fn bot(&self, bot_id: &str) -> Option<BotRecord> {
        self.lock().bots.iter().find(|b| b.id == bot_id).cloned()
    }

    pub fn bot_count(&self) -> usize {
        self.lock().bots.len()
    }

    pub fn calls(&self) -> Vec<DirectoryCall> {
        self.lock().calls.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, DirectoryCall::Create { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record `call` and return the pending injected failure, if any.
    fn enter(&self, call: DirectoryCall) -> Result<MutexGuard<'_, State>, SyncError> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }
}

fn not_found(what: &str, id: &str) -> SyncError {
    SyncError::PermanentApi {
        status: 404,
        body: format!("{what} {id} not found"),
    }
}

#[async_trait]
impl BotDirectory for MemoryBotDirectory {
    async fn create_bot(&self, request: &CreateBotRequest) -> Result<String, SyncError> {
        let mut state = self.enter(DirectoryCall::Create {
            meeting_url: request.meeting_url.clone(),
        })?;

        let bot_id = Uuid::new_v4().to_string();
        state.bots.push(BotRecord {
            id: bot_id.clone(),
            meeting_url: request.meeting_url.clone(),
            platform: Platform::detect(&request.meeting_url),
            status_changes: Vec::new(),
            recordings: Vec::new(),
        });
        info!(
            "Dry run: registered bot {} for {}",
            bot_id, request.meeting_url
        );
        Ok(bot_id)
    }

    async fn get_bot(&self, bot_id: &str) -> Result<BotRecord, SyncError> {
        let state = self.enter(DirectoryCall::Get(bot_id.to_string()))?;
        state
            .bots
            .iter()
            .find(|b| b.id == bot_id)
            .cloned()
            .ok_or_else(|| not_found("bot", bot_id))
    }

    async fn list_bots(&self) -> Result<Vec<BotRecord>, SyncError> {
        let state = self.enter(DirectoryCall::List)?;
        Ok(state.bots.clone())
    }

    async fn delete_bot(&self, bot_id: &str) -> Result<(), SyncError> {
        let mut state = self.enter(DirectoryCall::Delete(bot_id.to_string()))?;
        let before = state.bots.len();
        state.bots.retain(|b| b.id != bot_id);
        if state.bots.len() == before {
            return Err(not_found("bot", bot_id));
        }
        Ok(())
    }

    async fn recordings(&self, bot_id: &str) -> Result<Vec<Recording>, SyncError> {
        let state = self.enter(DirectoryCall::Recordings(bot_id.to_string()))?;
        state
            .bots
            .iter()
            .find(|b| b.id == bot_id)
            .map(|b| b.recordings.clone())
            .ok_or_else(|| not_found("bot", bot_id))
    }

    async fn transcript_download_url(&self, transcript_id: &str) -> Result<String, SyncError> {
        let state = self.enter(DirectoryCall::TranscriptUrl(transcript_id.to_string()))?;
        if !state.transcripts.contains_key(transcript_id) {
            return Err(not_found("transcript", transcript_id));
        }
        // Each request yields a distinct URL, like a pre-signed link would.
        Ok(format!(
            "{TRANSCRIPT_SCHEME}{transcript_id}?token={}",
            Uuid::new_v4()
        ))
    }

    async fn download(&self, url: &str) -> Result<String, SyncError> {
        let state = self.enter(DirectoryCall::Download(url.to_string()))?;
        let transcript_id = url
            .strip_prefix(TRANSCRIPT_SCHEME)
            .and_then(|rest| rest.split('?').next())
            .ok_or_else(|| not_found("download", url))?;
        state
            .transcripts
            .get(transcript_id)
            .cloned()
            .ok_or_else(|| not_found("transcript", transcript_id))
    }
}
