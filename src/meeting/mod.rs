//! Meeting lifecycle.
//!
//! A meeting record follows the bot that records it. Status only moves
//! forward; `failed` and `cancelled` are side exits.

pub mod status;

pub use status::{next_status, status_for_bot_code, MeetingStatus};
