//! Error types for reconciliation work.
//!
//! Errors are classified by what the caller should do with the entity:
//! - Transient: timeouts, connection failures, 5xx. Leave state alone, the
//!   next tick retries.
//! - PermanentApi: the directory rejected the request (4xx).
//! - DataIntegrity: someone else already claimed the event or bot. Callers
//!   treat this as "already handled".
//! - Parse: the payload did not have the expected shape.

use thiserror::Error;

/// Max bytes of a raw payload kept for diagnostics.
pub const SAMPLE_LIMIT: usize = 1_500;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("bot directory rejected request ({status}): {body}")]
    PermanentApi { status: u16, body: String },

    #[error("data integrity conflict: {0}")]
    DataIntegrity(String),

    #[error("unexpected payload: {message}")]
    Parse { message: String, sample: String },

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl SyncError {
    pub fn parse(message: impl Into<String>, raw: &str) -> Self {
        Self::Parse {
            message: message.into(),
            sample: truncate_sample(raw, SAMPLE_LIMIT),
        }
    }

    /// Returns true if nothing should change and the next tick should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Returns true if the directory conclusively reported the bot as gone.
    pub fn is_bot_missing(&self) -> bool {
        matches!(self, SyncError::PermanentApi { status: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::DataIntegrity(_))
    }

    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transient(_) => "transient",
            SyncError::PermanentApi { .. } => "permanent_api",
            SyncError::DataIntegrity(_) => "data_integrity",
            SyncError::Parse { .. } => "parse",
            SyncError::Storage(_) => "storage",
        }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        if crate::db::is_unique_violation(&err) {
            SyncError::DataIntegrity(format!("{err:#}"))
        } else {
            SyncError::Storage(err)
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SyncError::Parse {
                message: err.to_string(),
                sample: String::new(),
            };
        }
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), err.to_string());
        }
        SyncError::Transient(err.to_string())
    }
}

/// Map an HTTP status from the bot directory to an error class.
pub fn classify_status(status: u16, body: String) -> SyncError {
    if status == 408 || status == 429 || status >= 500 {
        SyncError::Transient(format!("HTTP {status}: {}", truncate_sample(&body, 300)))
    } else {
        SyncError::PermanentApi {
            status,
            body: truncate_sample(&body, SAMPLE_LIMIT),
        }
    }
}

pub fn truncate_sample(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
