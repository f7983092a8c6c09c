//! Local HTTP endpoints for child processes.
//!
//! Each model instance's child long-polls `next_task` between sessions and
//! peeks `initial_session` at boot to learn which fine-tune file to load.
//! The long poll is capped at a second so shutdown never hangs on it; the
//! child simply polls again.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::supervisor::Supervisor;

const LONG_POLL_CAP: Duration = Duration::from_secs(1);

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/v1/worker/task/:instance_id", get(next_task))
        .route(
            "/api/v1/worker/initial_session/:instance_id",
            get(initial_session),
        )
        .route("/health", get(|| async { "ok" }))
        .with_state(supervisor)
}

/// Pop the instance's next prepared task, waiting briefly for one to show
/// up. 204 tells the child to come back.
async fn next_task(
    State(supervisor): State<Arc<Supervisor>>,
    Path(instance_id): Path<String>,
) -> Response {
    let Some(instance) = supervisor.get_instance(&instance_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(task) = instance.pop_task().await {
        return Json(task).into_response();
    }

    tokio::select! {
        _ = instance.notified() => {}
        _ = tokio::time::sleep(LONG_POLL_CAP) => {
            return StatusCode::NO_CONTENT.into_response();
        }
    }

    match instance.pop_task().await {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Read-only view of the session the instance holds, without popping it.
async fn initial_session(
    State(supervisor): State<Arc<Supervisor>>,
    Path(instance_id): Path<String>,
) -> Response {
    let Some(instance) = supervisor.get_instance(&instance_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match instance.peek_session() {
        Some(session) => Json(session).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
