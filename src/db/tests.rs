use super::*;
use crate::meeting::MeetingStatus;
use crate::urls::Platform;
use chrono::TimeZone;

fn table_exists(conn: &Connection, name: &str) -> bool {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [name],
            |row| row.get(0),
        )
        .unwrap();
    count == 1
}

#[test]
fn test_migrate_creates_tables() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();

    for table in [
        "accounts",
        "calendar_events",
        "meetings",
        "bot_records",
        "meeting_bot_links",
        "transcripts",
        "automation_runs",
    ] {
        assert!(table_exists(&conn, table), "missing table {table}");
    }
}

#[test]
fn test_migrate_is_idempotent() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    migrate(&conn).unwrap();
}

#[test]
fn test_open_creates_file_and_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("notetaker.db");

    let conn = open_connection(&path).unwrap();
    assert!(path.exists());
    assert!(table_exists(&conn, "meetings"));
}

#[test]
fn test_db_time_orders_lexically() {
    let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
    let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
    assert!(to_db_time(early) < to_db_time(late));
    assert_eq!(to_db_time(late), "2026-01-10T00:00:00.000000Z");
}

#[test]
fn test_unique_violation_detection() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
    let meeting = NewMeeting {
        account_id: "acct",
        calendar_event_id: "evt",
        bot_id: Some("bot-1"),
        status: MeetingStatus::Scheduled,
        platform: Platform::Zoom,
    };

    MeetingRepository::insert(&conn, &meeting, now).unwrap();
    let err = MeetingRepository::insert(&conn, &meeting, now).unwrap_err();
    assert!(is_unique_violation(&err));

    let other = anyhow::anyhow!("Failed to open database");
    assert!(!is_unique_violation(&other));

    let not_null = conn
        .execute("INSERT INTO accounts (id) VALUES ('x')", [])
        .map_err(anyhow::Error::from)
        .unwrap_err();
    assert!(!is_unique_violation(&not_null));
}

#[test]
fn test_rollback_discards_writes() {
    let conn = Connection::open_in_memory().unwrap();
    migrate(&conn).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();

    begin_immediate(&conn).unwrap();
    AccountRepository::ensure(&conn, "acct", now).unwrap();
    rollback(&conn).unwrap();
    assert!(AccountRepository::list(&conn).unwrap().is_empty());

    begin_immediate(&conn).unwrap();
    AccountRepository::ensure(&conn, "acct", now).unwrap();
    commit(&conn).unwrap();
    assert_eq!(AccountRepository::list(&conn).unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_shares_one_connection() {
    let store = Store::open_in_memory().unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();

    let clone = store.clone();
    AccountRepository::ensure(&*clone.lock().await, "acct", now).unwrap();

    let conn = store.lock().await;
    assert_eq!(AccountRepository::list(&conn).unwrap().len(), 1);
}
