//! REST API server.
//!
//! Provides HTTP endpoints for:
//! - Meeting records, their transcripts and bot links
//! - Requesting and withdrawing a bot for a calendar event
//! - Scheduler task status

pub mod error;
pub mod routes;

use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::future::Future;
use tower::ServiceBuilder;
use tracing::info;

use crate::reconcile::Reconciler;
use crate::scheduler::TaskStatusHandle;

/// Shared state for every route.
#[derive(Clone)]
pub struct ApiState {
    pub reconciler: Reconciler,
    pub tasks: TaskStatusHandle,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .merge(routes::status::router(state.clone()))
        .merge(routes::meetings::router(state.clone()))
        .merge(routes::events::router(state))
        .layer(ServiceBuilder::new())
}

pub struct ApiServer {
    port: u16,
    state: ApiState,
}

impl ApiServer {
    pub fn new(port: u16, state: ApiState) -> Self {
        Self { port, state }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let app = router(self.state);
        let listener = tokio::net::TcpListener::bind(&format!("127.0.0.1:{}", self.port)).await?;

        info!("API server listening on http://127.0.0.1:{}", self.port);
        info!("Endpoints:");
        info!("  GET    /                       - Service info");
        info!("  GET    /status                 - Scheduler task status");
        info!("  GET    /meetings               - List meetings");
        info!("  GET    /meetings/:id           - Get a meeting");
        info!("  GET    /meetings/:id/transcript - Get a meeting's transcript");
        info!("  GET    /meetings/:id/bots      - List bots linked to a meeting");
        info!("  POST   /events/:id/dispatch    - Request a bot for an event");
        info!("  DELETE /events/:id/dispatch    - Withdraw a bot request");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

async fn service_info() -> Json<Value> {
    Json(json!({
        "service": "notetaker",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}
