//! Bot requests for calendar events.
//!
//! POST marks the event as wanting a bot and dispatches it immediately;
//! DELETE withdraws the request.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::ApiState;
use crate::db::CalendarEventRepository;
use crate::reconcile::{DispatchOutcome, WithdrawOutcome};

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/events/:id/dispatch",
            post(request_dispatch).delete(withdraw_dispatch),
        )
        .with_state(state)
}

/// POST /events/:id/dispatch
async fn request_dispatch(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
) -> ApiResult<(StatusCode, Json<DispatchOutcome>)> {
    let exists = {
        let conn = state.reconciler.store().lock().await;
        CalendarEventRepository::get(&conn, &event_id)?.is_some()
    };
    if !exists {
        return Err(ApiError::not_found(format!("Event {} not found", event_id)));
    }

    info!(event_id = %event_id, "Dispatch requested via API");
    let outcome = state.reconciler.request_dispatch(&event_id).await?;
    let status = match outcome {
        DispatchOutcome::Created { .. } => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// DELETE /events/:id/dispatch
async fn withdraw_dispatch(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WithdrawOutcome>> {
    info!(event_id = %event_id, "Dispatch withdrawn via API");
    match state.reconciler.withdraw_dispatch(&event_id).await? {
        WithdrawOutcome::EventNotFound => {
            Err(ApiError::not_found(format!("Event {} not found", event_id)))
        }
        outcome => Ok(Json(outcome)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::error::SyncError;
    use crate::reconcile::test_support::add_event;
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, Utc};

    const URL: &str = "https://meet.google.com/abc-defg-hij";

    #[tokio::test]
    async fn test_request_then_withdraw() {
        let (app, state, directory) = app().await;
        add_event(&state.reconciler, "evt", Some(URL), Utc::now() + Duration::hours(2), false).await;

        let (status, body) = call(&app, Method::POST, "/events/evt/dispatch").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "created");
        let bot_id = body["bot_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::POST, "/events/evt/dispatch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_satisfied");
        assert_eq!(directory.create_calls(), 1);

        let (status, body) = call(&app, Method::DELETE, "/events/evt/dispatch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "cancelled");
        assert_eq!(body["bot_deleted"], true);
        assert!(directory.bot(&bot_id).is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_found() {
        let (app, _, _) = app().await;
        let (status, _) = call(&app, Method::POST, "/events/nope/dispatch").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::DELETE, "/events/nope/dispatch").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_directory_outage_surfaces_as_unavailable() {
        let (app, state, directory) = app().await;
        add_event(&state.reconciler, "evt", Some(URL), Utc::now() + Duration::hours(2), false).await;
        directory.fail_next(SyncError::Transient("connection refused".into()));

        let (status, body) = call(&app, Method::POST, "/events/evt/dispatch").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "transient");
    }
}
