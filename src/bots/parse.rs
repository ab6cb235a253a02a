//! Tolerant decoding of bot directory payloads.
//!
//! Field names drift between API versions (`id` vs `bot_id`, `meeting_url` as
//! a string or as an object), so bots are read through JSON pointers rather
//! than a fixed serde shape.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;

use super::{BotRecord, Recording, StatusChange};
use crate::error::SyncError;
use crate::urls::Platform;

pub fn parse_json(body: &str) -> Result<JsonValue, SyncError> {
    serde_json::from_str(body).map_err(|err| SyncError::parse(format!("invalid JSON: {err}"), body))
}

/// Extract the bot id from a create response.
pub fn parse_create_response(body: &str) -> Result<String, SyncError> {
    let payload = parse_json(body)?;
    value_at_any(&payload, &["/id", "/bot_id", "/bot/id"])
        .and_then(scalar_to_string)
        .ok_or_else(|| SyncError::parse("missing bot id in create response", body))
}

pub fn parse_bot(body: &str) -> Result<BotRecord, SyncError> {
    let payload = parse_json(body)?;
    bot_from_value(&payload).map_err(|message| SyncError::parse(message, body))
}

/// Decode one page of a bot listing. Accepts a bare array or a
/// `{ "results": [...], "next": ... }` envelope. Items that cannot be decoded
/// are skipped with a warning.
pub fn parse_bot_page(body: &str) -> Result<(Vec<BotRecord>, Option<String>), SyncError> {
    let payload = parse_json(body)?;

    let mut next_url = None;
    let items: Vec<JsonValue> = match &payload {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(obj) => {
            next_url = obj
                .get("next")
                .and_then(|value| value.as_str())
                .filter(|url| !url.trim().is_empty())
                .map(ToOwned::to_owned);
            match obj.get("results") {
                Some(JsonValue::Array(items)) => items.clone(),
                _ if obj.contains_key("id") || obj.contains_key("bot_id") => vec![payload.clone()],
                _ => return Err(SyncError::parse("bot listing has no results", body)),
            }
        }
        _ => return Err(SyncError::parse("bot listing is not an array or object", body)),
    };

    let mut bots = Vec::with_capacity(items.len());
    for item in &items {
        match bot_from_value(item) {
            Ok(bot) => bots.push(bot),
            Err(message) => warn!("Skipping undecodable bot in listing: {}", message),
        }
    }

    Ok((bots, next_url))
}

/// Decode the short-lived download URL of a transcript resource.
pub fn parse_download_url(body: &str) -> Result<String, SyncError> {
    let payload = parse_json(body)?;
    value_at_any(&payload, &["/data/download_url", "/download_url", "/url"])
        .and_then(scalar_to_string)
        .ok_or_else(|| SyncError::parse("transcript has no download_url", body))
}

pub fn parse_recordings(body: &str) -> Result<Vec<Recording>, SyncError> {
    let payload = parse_json(body)?;
    let items = match &payload {
        JsonValue::Array(items) => items.as_slice(),
        JsonValue::Object(obj) => match obj.get("recordings").or_else(|| obj.get("results")) {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(JsonValue::Null) | None => &[],
            Some(_) => return Err(SyncError::parse("recordings is not an array", body)),
        },
        _ => return Err(SyncError::parse("recording manifest has unexpected shape", body)),
    };
    Ok(items.iter().filter_map(recording_from_value).collect())
}

pub fn bot_from_value(value: &JsonValue) -> Result<BotRecord, String> {
    let id = value_at_any(value, &["/id", "/bot_id", "/bot/id"])
        .and_then(scalar_to_string)
        .ok_or_else(|| "bot has no id".to_string())?;

    let (meeting_url, platform) = value
        .get("meeting_url")
        .and_then(meeting_url_from_value)
        .unwrap_or_else(|| (String::new(), Platform::Other));

    let status_changes = match value.get("status_changes") {
        Some(JsonValue::Array(entries)) => entries
            .iter()
            .map(status_change_from_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("bot {id}: {err}"))?,
        Some(JsonValue::Null) | None => Vec::new(),
        Some(_) => return Err(format!("bot {id}: status_changes is not an array")),
    };

    let recordings = match value.get("recordings") {
        Some(JsonValue::Array(items)) => items.iter().filter_map(recording_from_value).collect(),
        _ => Vec::new(),
    };

    Ok(BotRecord {
        id,
        meeting_url,
        platform,
        status_changes,
        recordings,
    })
}

/// The directory reports the meeting either as the raw join URL or as a
/// `{ meeting_id, platform, meeting_password }` object. Objects are turned
/// back into a join URL where the platform allows it.
pub fn meeting_url_from_value(value: &JsonValue) -> Option<(String, Platform)> {
    match value {
        JsonValue::String(url) if !url.trim().is_empty() => {
            Some((url.trim().to_string(), Platform::detect(url)))
        }
        JsonValue::Object(obj) => {
            let platform = obj
                .get("platform")
                .and_then(|p| p.as_str())
                .map(Platform::parse)
                .unwrap_or(Platform::Other);
            let meeting_id = obj.get("meeting_id").and_then(scalar_to_string)?;
            let password = obj.get("meeting_password").and_then(scalar_to_string);

            let url = match platform {
                Platform::Zoom => match password {
                    Some(pwd) => format!("https://zoom.us/j/{meeting_id}?pwd={pwd}"),
                    None => format!("https://zoom.us/j/{meeting_id}"),
                },
                Platform::GoogleMeet => format!("https://meet.google.com/{meeting_id}"),
                _ => meeting_id,
            };
            Some((url, platform))
        }
        _ => None,
    }
}

fn status_change_from_value(value: &JsonValue) -> Result<StatusChange, String> {
    let code = value
        .get("code")
        .and_then(scalar_to_string)
        .ok_or_else(|| "status change without code".to_string())?;
    let sub_code = value.get("sub_code").and_then(scalar_to_string);
    let raw_at = value
        .get("created_at")
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("status change {code} without created_at"))?;
    let created_at = parse_timestamp(raw_at)
        .ok_or_else(|| format!("status change {code} has invalid created_at {raw_at:?}"))?;

    Ok(StatusChange {
        code,
        sub_code,
        created_at,
    })
}

fn recording_from_value(value: &JsonValue) -> Option<Recording> {
    let id = value.get("id").and_then(scalar_to_string)?;
    let status = value_at_any(value, &["/status/code", "/status"])
        .and_then(scalar_to_string)
        .unwrap_or_default();

    let transcript = value_at_any(value, &["/media_shortcuts/transcript", "/transcript"]);
    let transcript_id = transcript
        .and_then(|t| t.get("id"))
        .and_then(scalar_to_string);
    let transcript_status = transcript
        .and_then(|t| value_at_any(t, &["/status/code", "/status"]))
        .and_then(scalar_to_string);

    let video_url = value_at_any(
        value,
        &[
            "/media_shortcuts/video_mixed/data/download_url",
            "/video_url",
        ],
    )
    .and_then(scalar_to_string);
    let audio_url = value_at_any(
        value,
        &[
            "/media_shortcuts/audio_mixed/data/download_url",
            "/audio_url",
        ],
    )
    .and_then(scalar_to_string);

    Some(Recording {
        id,
        status,
        transcript_id,
        transcript_status,
        video_url,
        audio_url,
    })
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn value_at_any<'a>(payload: &'a JsonValue, pointers: &[&str]) -> Option<&'a JsonValue> {
    pointers.iter().find_map(|pointer| payload.pointer(pointer))
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(value) if !value.trim().is_empty() => Some(value.clone()),
        JsonValue::Number(value) => Some(value.to_string()),
        _ => None,
    }
}
