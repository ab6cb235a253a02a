//! Meeting record API endpoints.
//!
//! Provides HTTP endpoints for:
//! - Listing meetings (GET /meetings)
//! - Getting a specific meeting (GET /meetings/:id)
//! - Getting a meeting's transcript (GET /meetings/:id/transcript)
//! - Listing the bots linked to a meeting (GET /meetings/:id/bots)

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::db::{
    AutomationRunRepository, BotRecordRepository, Meeting, MeetingBotLinkRepository,
    MeetingFilter, MeetingRepository, TranscriptRecord, TranscriptRepository,
};
use crate::meeting::MeetingStatus;

/// Query parameters for listing meetings.
#[derive(Debug, Deserialize, Default)]
pub struct MeetingQueryParams {
    pub account: Option<String>,
    pub status: Option<String>,
    /// Maximum results (default 20)
    pub limit: Option<usize>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/meetings", get(list_meetings))
        .route("/meetings/:id", get(get_meeting))
        .route("/meetings/:id/transcript", get(get_transcript))
        .route("/meetings/:id/bots", get(list_bots))
        .with_state(state)
}

/// GET /meetings - Most recent meetings first.
async fn list_meetings(
    State(state): State<ApiState>,
    Query(params): Query<MeetingQueryParams>,
) -> ApiResult<Json<Vec<Meeting>>> {
    let status = params
        .status
        .as_deref()
        .map(MeetingStatus::parse)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let filter = MeetingFilter {
        account_id: params.account,
        status,
        limit: Some(params.limit.unwrap_or(20)),
    };

    let conn = state.reconciler.store().lock().await;
    let meetings = MeetingRepository::list(&conn, &filter)?;
    Ok(Json(meetings))
}

/// GET /meetings/:id - A meeting with its automation runs.
async fn get_meeting(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let conn = state.reconciler.store().lock().await;
    let meeting = MeetingRepository::get(&conn, id)?
        .ok_or_else(|| ApiError::not_found(format!("Meeting {} not found", id)))?;
    let automation_runs = AutomationRunRepository::for_meeting(&conn, id)?;
    let has_transcript = TranscriptRepository::get(&conn, id)?.is_some();

    Ok(Json(json!({
        "meeting": meeting,
        "has_transcript": has_transcript,
        "automation_runs": automation_runs,
    })))
}

/// GET /meetings/:id/transcript
async fn get_transcript(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<TranscriptRecord>> {
    let conn = state.reconciler.store().lock().await;
    let transcript = TranscriptRepository::get(&conn, id)?
        .ok_or_else(|| ApiError::not_found(format!("No transcript for meeting {}", id)))?;
    Ok(Json(transcript))
}

/// GET /meetings/:id/bots - Link history with the cached copy of each bot.
async fn list_bots(State(state): State<ApiState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let conn = state.reconciler.store().lock().await;
    if MeetingRepository::get(&conn, id)?.is_none() {
        return Err(ApiError::not_found(format!("Meeting {} not found", id)));
    }

    let mut bots = Vec::new();
    for link in MeetingBotLinkRepository::for_meeting(&conn, id)? {
        let cached = BotRecordRepository::get(&conn, &link.bot_id)?;
        let derived = cached.as_ref().map(|bot| bot.derived());
        bots.push(json!({
            "link": link,
            "current_status": derived.as_ref().and_then(|d| d.current.clone()),
            "bot": cached,
        }));
    }

    Ok(Json(json!({ "meeting_id": id, "bots": bots })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::bots::Recording;
    use crate::reconcile::test_support::add_event;
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};

    const URL: &str = "https://zoom.us/j/1234567890";

    #[tokio::test]
    async fn test_list_and_get_meeting() {
        let (app, state, _) = app().await;
        add_event(&state.reconciler, "evt", Some(URL), Utc::now() + Duration::minutes(5), true).await;
        state.reconciler.dispatch("evt").await.unwrap();

        let (status, body) = call(&app, Method::GET, "/meetings?account=acct").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        let id = body[0]["id"].as_i64().unwrap();
        assert_eq!(body[0]["status"], "scheduled");

        let (status, body) = call(&app, Method::GET, &format!("/meetings/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meeting"]["calendar_event_id"], "evt");
        assert_eq!(body["has_transcript"], false);

        let (_, body) = call(&app, Method::GET, "/meetings?status=ready").await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_status_and_missing_meeting() {
        let (app, _, _) = app().await;

        let (status, body) = call(&app, Method::GET, "/meetings?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], true);

        let (status, _) = call(&app, Method::GET, "/meetings/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::GET, "/meetings/42/transcript").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bots_and_transcript_after_processing() {
        let (app, state, directory) = app().await;
        add_event(&state.reconciler, "evt", Some(URL), Utc::now() - Duration::minutes(30), true).await;
        let created = state.reconciler.dispatch("evt").await.unwrap();
        let crate::reconcile::DispatchOutcome::Created { meeting_id, bot_id } = created else {
            panic!("expected a created bot, got {created:?}");
        };

        directory.push_status(&bot_id, "done", Utc::now());
        directory.add_recording(
            &bot_id,
            Recording {
                id: "rec".into(),
                status: "done".into(),
                transcript_id: Some("tr".into()),
                transcript_status: Some("done".into()),
                ..Default::default()
            },
        );
        directory.set_transcript(
            "tr",
            r#"[{"participant": {"name": "Alice"}, "words": [{"text": "Hello"}]}]"#,
        );
        state.reconciler.sync_meeting(meeting_id).await.unwrap();

        let (status, body) = call(&app, Method::GET, &format!("/meetings/{meeting_id}/bots")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bots"][0]["link"]["bot_id"], bot_id.as_str());
        assert_eq!(body["bots"][0]["link"]["origin"], "dispatched");
        assert_eq!(body["bots"][0]["current_status"], "done");

        // No transcript queue in this setup, so nothing is stored yet.
        let (status, _) = call(&app, Method::GET, &format!("/meetings/{meeting_id}/transcript")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
