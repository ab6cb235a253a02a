//! Scheduler task status.

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::api::ApiState;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(task_status))
        .with_state(state)
}

/// GET /status - Last known state of every task that has ticked.
async fn task_status(State(state): State<ApiState>) -> Json<Value> {
    let tasks = state.tasks.snapshot().await;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "tasks": tasks,
    }))
}
