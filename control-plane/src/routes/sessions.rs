//! Session intake: create sessions and extend them with new interactions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use fleet_common::{
    Interaction, ModelName, Session, SessionMode, SessionSummary, SessionType, WebsocketEvent,
    WebsocketEventType,
};

use crate::AppState;

use super::ApiError;

/// Request body for creating or extending a session.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// If set and known, a new user interaction is appended to the
    /// existing session and it re-enters the queue.
    #[serde(default)]
    pub session_id: String,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub model_name: ModelName,
    #[serde(default)]
    pub lora_dir: String,
    pub message: String,
    pub owner: String,
    #[serde(default)]
    pub priority: bool,
}

/// `POST /api/v1/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Session>, ApiError> {
    let now = Utc::now();

    let session = if !request.session_id.is_empty() {
        let mut session = state
            .store
            .get_session(&request.session_id)
            .await
            .ok_or_else(|| ApiError::SessionNotFound(request.session_id.clone()))?;
        session.updated = now;
        session.interactions.push(Interaction::new_user(
            Uuid::new_v4().to_string(),
            request.message,
            now,
        ));
        session
            .interactions
            .push(Interaction::new_system(Uuid::new_v4().to_string(), now));
        state.store.update_session(session.clone()).await;
        session
    } else {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            created: now,
            updated: now,
            parent_session: String::new(),
            mode: request.mode,
            session_type: request.session_type,
            model_name: request.model_name,
            lora_dir: request.lora_dir,
            interactions: vec![
                Interaction::new_user(Uuid::new_v4().to_string(), request.message, now),
                Interaction::new_system(Uuid::new_v4().to_string(), now),
            ],
            owner: request.owner,
            priority: request.priority,
        };
        state.store.create_session(session.clone()).await;
        session
    };

    state.queue.enqueue(session.clone());
    tracing::info!(
        "queued session {} (model={}, mode={:?})",
        session.id,
        session.model_name,
        session.mode
    );

    state.push.broadcast(WebsocketEvent {
        event_type: WebsocketEventType::SessionUpdate,
        session_id: session.id.clone(),
        owner: session.owner.clone(),
        session: Some(session.clone()),
        worker_task_response: None,
    });

    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub owner: Option<String>,
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<SessionSummary>> {
    Json(state.store.list_sessions(params.owner.as_deref()).await)
}

/// `GET /api/v1/sessions/{id}`
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .store
        .get_session(&id)
        .await
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}
