//! Worker-facing API: session polling, heartbeats and task responses.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use fleet_common::{
    InteractionState, RunnerState, RunnerTaskResponse, Session, SessionFilter, TaskResponseType,
    WebsocketEvent, WebsocketEventType,
};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PollParams {
    pub runner_id: String,
}

/// `POST /api/v1/worker/session` — called by runners on each tick with
/// their current filter. Returns a session to run or 204.
pub async fn poll_session(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PollParams>,
    Json(filter): Json<SessionFilter>,
) -> Response {
    match state.scheduler.poll(&params.runner_id, filter).await {
        Some(session) => {
            tracing::info!(
                "assigned session {} to runner {}",
                session.id,
                params.runner_id
            );
            Json(session).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// `POST /api/v1/worker/state` — runner heartbeat.
pub async fn post_state(
    State(state): State<Arc<AppState>>,
    Json(runner_state): Json<RunnerState>,
) -> StatusCode {
    state.scheduler.update_runner(runner_state).await;
    StatusCode::OK
}

/// `POST /api/v1/worker/response/{instance_id}` — a task response coming
/// back from a model instance. Applies it to the stored session and fans it
/// out to connected clients.
pub async fn post_response(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(response): Json<RunnerTaskResponse>,
) -> StatusCode {
    let Some(mut session) = state.store.get_session(&response.session_id).await else {
        tracing::warn!(
            "task response from instance {} for unknown session {}",
            instance_id,
            response.session_id
        );
        return StatusCode::OK;
    };

    apply_response(&mut session, &response);
    state.store.update_session(session.clone()).await;

    state.push.broadcast(WebsocketEvent {
        event_type: WebsocketEventType::WorkerTaskResponse,
        session_id: response.session_id.clone(),
        owner: session.owner.clone(),
        session: Some(session),
        worker_task_response: Some(response),
    });

    StatusCode::OK
}

/// Fold one task response into the session's working interaction.
pub fn apply_response(session: &mut Session, response: &RunnerTaskResponse) {
    let now = Utc::now();
    session.updated = now;

    if response.response_type == TaskResponseType::Result && !response.lora_dir.is_empty() {
        session.lora_dir = response.lora_dir.clone();
    }

    let Some(interaction) = session.working_interaction_mut() else {
        return;
    };
    interaction.updated = now;

    match response.response_type {
        TaskResponseType::Stream => {
            // stream chunks accumulate into the message being written
            interaction.message.push_str(&response.message);
            interaction.state = InteractionState::Editing;
        }
        TaskResponseType::Progress => {
            interaction.progress = response.progress;
            if !response.status.is_empty() {
                interaction.status = response.status.clone();
            }
            interaction.state = InteractionState::Editing;
        }
        TaskResponseType::Result => {
            if !response.message.is_empty() {
                interaction.message = response.message.clone();
            }
            if !response.files.is_empty() {
                interaction.files = response.files.clone();
            }
            if !response.lora_dir.is_empty() {
                interaction.lora_dir = response.lora_dir.clone();
            }
            interaction.progress = 100;
            interaction.finished = true;
            interaction.completed = Some(now);
            if response.error.is_empty() {
                interaction.state = InteractionState::Complete;
            } else {
                interaction.state = InteractionState::Error;
                interaction.error = response.error.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{Interaction, ModelName, SessionMode, SessionType};

    fn test_session() -> Session {
        let now = Utc::now();
        Session {
            id: "ses-1".to_string(),
            name: String::new(),
            created: now,
            updated: now,
            parent_session: String::new(),
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            model_name: ModelName::Mistral7bInstruct,
            lora_dir: String::new(),
            interactions: vec![
                Interaction::new_user("int-1".to_string(), "hi".to_string(), now),
                Interaction::new_system("int-2".to_string(), now),
            ],
            owner: "user-1".to_string(),
            priority: false,
        }
    }

    fn stream_chunk(message: &str) -> RunnerTaskResponse {
        RunnerTaskResponse {
            response_type: TaskResponseType::Stream,
            session_id: "ses-1".to_string(),
            interaction_id: "int-2".to_string(),
            owner: "user-1".to_string(),
            message: message.to_string(),
            progress: 0,
            status: String::new(),
            files: vec![],
            lora_dir: String::new(),
            error: String::new(),
            done: false,
        }
    }

    #[test]
    fn test_stream_chunks_accumulate() {
        let mut session = test_session();
        apply_response(&mut session, &stream_chunk("hello "));
        apply_response(&mut session, &stream_chunk("world"));

        let interaction = session.working_interaction().unwrap();
        assert_eq!(interaction.message, "hello world");
        assert_eq!(interaction.state, InteractionState::Editing);
        assert!(!interaction.finished);
    }

    #[test]
    fn test_result_completes_interaction() {
        let mut session = test_session();
        apply_response(&mut session, &stream_chunk("partial"));

        let mut result = stream_chunk("the full answer");
        result.response_type = TaskResponseType::Result;
        result.done = true;
        apply_response(&mut session, &result);

        let interaction = session.working_interaction().unwrap();
        assert_eq!(interaction.message, "the full answer");
        assert_eq!(interaction.state, InteractionState::Complete);
        assert_eq!(interaction.progress, 100);
        assert!(interaction.finished);
        assert!(interaction.completed.is_some());
    }

    #[test]
    fn test_error_result_marks_error_state() {
        let mut session = test_session();
        let response = RunnerTaskResponse::error("ses-1".to_string(), "child crashed".to_string());
        apply_response(&mut session, &response);

        let interaction = session.working_interaction().unwrap();
        assert_eq!(interaction.state, InteractionState::Error);
        assert_eq!(interaction.error, "child crashed");
        assert!(interaction.finished);
    }

    #[test]
    fn test_finetune_result_hoists_lora_dir() {
        let mut session = test_session();
        session.mode = SessionMode::Finetune;

        let mut result = stream_chunk("");
        result.response_type = TaskResponseType::Result;
        result.lora_dir = "sessions/ses-1/lora".to_string();
        result.done = true;
        apply_response(&mut session, &result);

        assert_eq!(session.lora_dir, "sessions/ses-1/lora");
        let interaction = session.working_interaction().unwrap();
        assert_eq!(interaction.lora_dir, "sessions/ses-1/lora");
    }

    #[test]
    fn test_progress_updates() {
        let mut session = test_session();
        let mut progress = stream_chunk("");
        progress.response_type = TaskResponseType::Progress;
        progress.progress = 42;
        progress.status = "training epoch 2".to_string();
        apply_response(&mut session, &progress);

        let interaction = session.working_interaction().unwrap();
        assert_eq!(interaction.progress, 42);
        assert_eq!(interaction.status, "training epoch 2");
    }
}
