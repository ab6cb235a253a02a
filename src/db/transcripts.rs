use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{time_column, to_db_time};

/// Flattened transcript text plus the media it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptRecord {
    pub meeting_id: i64,
    pub bot_id: String,
    pub recording_id: Option<String>,
    pub text: String,
    pub segment_count: usize,
    pub video_url: Option<String>,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct TranscriptRepository;

impl TranscriptRepository {
    /// Store the transcript for a meeting, replacing any earlier one.
    pub fn upsert(conn: &Connection, record: &TranscriptRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO transcripts \
                (meeting_id, bot_id, recording_id, text, segment_count, video_url, audio_url, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(meeting_id) DO UPDATE SET \
                bot_id = excluded.bot_id, \
                recording_id = excluded.recording_id, \
                text = excluded.text, \
                segment_count = excluded.segment_count, \
                video_url = excluded.video_url, \
                audio_url = excluded.audio_url, \
                created_at = excluded.created_at",
            params![
                record.meeting_id,
                record.bot_id,
                record.recording_id,
                record.text,
                record.segment_count as i64,
                record.video_url,
                record.audio_url,
                to_db_time(record.created_at),
            ],
        )
        .context("Failed to store transcript")?;
        Ok(())
    }

    pub fn get(conn: &Connection, meeting_id: i64) -> Result<Option<TranscriptRecord>> {
        conn.query_row(
            "SELECT meeting_id, bot_id, recording_id, text, segment_count, video_url, audio_url, \
             created_at FROM transcripts WHERE meeting_id = ?1",
            params![meeting_id],
            |row| {
                Ok(TranscriptRecord {
                    meeting_id: row.get(0)?,
                    bot_id: row.get(1)?,
                    recording_id: row.get(2)?,
                    text: row.get(3)?,
                    segment_count: row.get::<_, i64>(4)?.max(0) as usize,
                    video_url: row.get(5)?,
                    audio_url: row.get(6)?,
                    created_at: time_column(row, 7)?,
                })
            },
        )
        .optional()
        .context("Failed to query transcript")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::meetings::{MeetingRepository, NewMeeting};
    use crate::db::migrate;
    use crate::meeting::MeetingStatus;
    use crate::urls::Platform;
    use chrono::TimeZone;

    #[test]
    fn test_upsert_replaces() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let meeting_id = MeetingRepository::insert(
            &conn,
            &NewMeeting {
                account_id: "acct",
                calendar_event_id: "evt",
                bot_id: Some("bot-1"),
                status: MeetingStatus::Processing,
                platform: Platform::Zoom,
            },
            at,
        )
        .unwrap();

        let mut record = TranscriptRecord {
            meeting_id,
            bot_id: "bot-1".to_string(),
            recording_id: Some("rec-1".to_string()),
            text: "Alice: hi".to_string(),
            segment_count: 1,
            video_url: None,
            audio_url: None,
            created_at: at,
        };
        TranscriptRepository::upsert(&conn, &record).unwrap();

        record.text = "Alice: hi\nBob: hello".to_string();
        record.segment_count = 2;
        TranscriptRepository::upsert(&conn, &record).unwrap();

        assert_eq!(TranscriptRepository::get(&conn, meeting_id).unwrap(), Some(record));
        assert!(TranscriptRepository::get(&conn, meeting_id + 1).unwrap().is_none());
    }
}
