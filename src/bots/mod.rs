//! Bot directory: the external service that hosts recording bots.
//!
//! The directory only supports create/get/list/delete plus recording and
//! transcript lookups. Nothing is pushed to us; lifecycle changes are observed
//! by polling and re-deriving status from each bot's status-change history.

pub mod client;
pub mod memory;
pub mod parse;
pub mod status;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SyncError;
use crate::urls::Platform;

pub use client::HttpBotDirectory;
pub use memory::MemoryBotDirectory;
pub use status::{canonical_code, derive, DerivedStatus};

/// One entry of a bot's status-change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub code: String,
    pub sub_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A recording produced by a bot, with the media it references.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Recording {
    pub id: String,
    pub status: String,
    pub transcript_id: Option<String>,
    pub transcript_status: Option<String>,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
}

impl Recording {
    pub fn is_complete(&self) -> bool {
        status::canonical_code(&self.status) == status::codes::DONE
    }
}

/// Local mirror of a bot as reported by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: String,
    pub meeting_url: String,
    pub platform: Platform,
    pub status_changes: Vec<StatusChange>,
    pub recordings: Vec<Recording>,
}

impl BotRecord {
    pub fn derived(&self) -> DerivedStatus {
        derive(&self.status_changes)
    }

    pub fn has_recording(&self) -> bool {
        self.recordings.iter().any(Recording::is_complete)
    }

    pub fn has_transcript(&self) -> bool {
        self.recordings.iter().any(|r| r.transcript_id.is_some())
    }

    /// True when `self` only appends to `previous`'s history.
    pub fn extends(&self, previous: &BotRecord) -> bool {
        previous.status_changes.len() <= self.status_changes.len()
            && previous
                .status_changes
                .iter()
                .zip(self.status_changes.iter())
                .all(|(old, new)| old == new)
    }
}

/// Parameters for creating a bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBotRequest {
    pub meeting_url: String,
    pub bot_name: String,
    /// When the bot should join; `None` joins immediately.
    pub join_at: Option<DateTime<Utc>>,
    /// Transcription provider; `None` disables transcription.
    pub transcript_provider: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl CreateBotRequest {
    pub fn new(meeting_url: impl Into<String>, bot_name: impl Into<String>) -> Self {
        Self {
            meeting_url: meeting_url.into(),
            bot_name: bot_name.into(),
            join_at: None,
            transcript_provider: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Operations the reconciler needs from the bot directory.
///
/// Every method must apply its own timeout. Timeouts and 5xx surface as
/// `SyncError::Transient`.
#[async_trait]
pub trait BotDirectory: Send + Sync {
    /// Create a bot, returning its external id. Irreversible once issued.
    async fn create_bot(&self, request: &CreateBotRequest) -> Result<String, SyncError>;

    async fn get_bot(&self, bot_id: &str) -> Result<BotRecord, SyncError>;

    /// All bots, following pagination to the end.
    async fn list_bots(&self) -> Result<Vec<BotRecord>, SyncError>;

    async fn delete_bot(&self, bot_id: &str) -> Result<(), SyncError>;

    /// The bot's recording manifest.
    async fn recordings(&self, bot_id: &str) -> Result<Vec<Recording>, SyncError>;

    /// A fresh, short-lived download URL for a transcript resource.
    async fn transcript_download_url(&self, transcript_id: &str) -> Result<String, SyncError>;

    /// Fetch a transcript payload from a download URL.
    async fn download(&self, url: &str) -> Result<String, SyncError>;
}
