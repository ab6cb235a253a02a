//! API route modules.

pub mod events;
pub mod meetings;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::api::{router, ApiState};
    use crate::bots::MemoryBotDirectory;
    use crate::reconcile::test_support::reconciler;
    use crate::scheduler::TaskStatusHandle;

    pub async fn app() -> (Router, ApiState, MemoryBotDirectory) {
        let (reconciler, directory) = reconciler().await;
        let state = ApiState {
            reconciler,
            tasks: TaskStatusHandle::default(),
        };
        (router(state.clone()), state, directory)
    }

    pub async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}
