//! Meeting lifecycle states and the transitions bot signals may cause.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::bots::status::codes;

/// Status of a meeting record.
///
/// `scheduled → recording → processing → ready`; any non-terminal state may
/// fail, and only `scheduled` may be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingStatus {
    Scheduled,
    Recording,
    Processing,
    Ready,
    Failed,
    Cancelled,
}

impl MeetingStatus {
    pub const ALL: [MeetingStatus; 6] = [
        Self::Scheduled,
        Self::Recording,
        Self::Processing,
        Self::Ready,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "recording" => Ok(Self::Recording),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => anyhow::bail!("Invalid meeting status: {}", s),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }

    /// Position along the happy path; terminal side exits have none.
    fn rank(&self) -> Option<u8> {
        match self {
            Self::Scheduled => Some(0),
            Self::Recording => Some(1),
            Self::Processing => Some(2),
            Self::Ready => Some(3),
            Self::Failed | Self::Cancelled => None,
        }
    }

    pub fn can_advance_to(&self, next: MeetingStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Cancelled => *self == Self::Scheduled,
            Self::Failed => true,
            _ => match (self.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Meeting status a canonical bot code maps to, if any.
pub fn status_for_bot_code(code: &str) -> Option<MeetingStatus> {
    match code {
        codes::STARTED | codes::JOINED | codes::RECORDING => Some(MeetingStatus::Recording),
        codes::DONE => Some(MeetingStatus::Processing),
        codes::ERROR | codes::FATAL => Some(MeetingStatus::Failed),
        _ => None,
    }
}

/// The status a meeting should move to given its bot's current code, or
/// `None` when the signal causes no forward move.
pub fn next_status(current: MeetingStatus, bot_code: Option<&str>) -> Option<MeetingStatus> {
    let target = status_for_bot_code(bot_code?)?;
    current.can_advance_to(target).then_some(target)
}
