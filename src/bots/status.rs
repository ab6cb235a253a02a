//! Status derivation over a bot's status-change history.
//!
//! The bot directory reports an append-only list of status changes. Everything
//! we need about a bot's lifecycle is a pure function of that list.

use chrono::{DateTime, Duration, Utc};

use super::StatusChange;

/// Canonical status codes.
pub mod codes {
    pub const STARTED: &str = "started";
    pub const JOINED: &str = "joined";
    pub const RECORDING: &str = "recording";
    pub const DONE: &str = "done";
    pub const ENDED: &str = "ended";
    pub const LEFT: &str = "left";
    pub const FATAL: &str = "fatal";
    pub const ERROR: &str = "error";
}

const START_CODES: &[&str] = &[codes::STARTED, codes::JOINED];
const END_CODES: &[&str] = &[codes::ENDED, codes::LEFT, codes::FATAL];

/// Map vendor spellings onto the canonical codes. Unknown codes pass through
/// lowercased.
pub fn canonical_code(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let canonical = match lowered.as_str() {
        "joining_call" | "in_waiting_room" => codes::STARTED,
        "in_call_not_recording" => codes::JOINED,
        "in_call_recording" => codes::RECORDING,
        "call_ended" => codes::ENDED,
        _ => return lowered,
    };
    canonical.to_string()
}

/// Lifecycle facts derived from a status-change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedStatus {
    /// Canonical code of the most recent entry.
    pub current: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recording_duration: Option<Duration>,
}

impl DerivedStatus {
    pub fn is_done(&self) -> bool {
        self.current.as_deref() == Some(codes::DONE)
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.recording_duration.map(|d| d.num_seconds())
    }
}

/// Derive the current status, start/end times and recording duration.
///
/// The current status is the entry with the latest timestamp; entries sharing
/// a timestamp keep their list order, so the later one wins.
pub fn derive(changes: &[StatusChange]) -> DerivedStatus {
    let mut ordered: Vec<&StatusChange> = changes.iter().collect();
    ordered.sort_by_key(|change| change.created_at);

    let current = ordered.last().map(|change| canonical_code(&change.code));
    let started_at = earliest_with(&ordered, START_CODES);
    let ended_at = earliest_with(&ordered, END_CODES);

    let recording_duration = match (started_at, ended_at) {
        (Some(start), Some(end)) => Some(end - start),
        _ => None,
    };

    DerivedStatus {
        current,
        started_at,
        ended_at,
        recording_duration,
    }
}

fn earliest_with(ordered: &[&StatusChange], wanted: &[&str]) -> Option<DateTime<Utc>> {
    ordered
        .iter()
        .find(|change| wanted.contains(&canonical_code(&change.code).as_str()))
        .map(|change| change.created_at)
}
