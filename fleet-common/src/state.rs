//! Runner heartbeat state and dashboard types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::SessionFilter;
use crate::model::ModelName;
use crate::session::{Session, SessionMode, SessionSummary};
use crate::task::RunnerTaskResponse;

/// Snapshot of one model instance, as reported in a runner heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstanceState {
    pub id: String,
    pub model_name: ModelName,
    pub mode: SessionMode,
    #[serde(default)]
    pub lora_dir: String,
    pub initial_session_id: String,
    /// The currently running session, or the queued session that will run
    /// next but is still downloading.
    #[serde(default)]
    pub current_session: Option<SessionSummary>,
    /// Recent sessions this instance has run, newest first.
    #[serde(default)]
    pub job_history: Vec<SessionSummary>,
    /// Seconds of inactivity before the instance calls itself stale.
    pub timeout_secs: u64,
    /// Unix timestamp of the last activity on this instance.
    pub last_activity: i64,
    pub stale: bool,
    pub memory_usage: u64,
}

/// The state a runner reports when it connects and keeps reporting while it
/// polls. The control plane expires these records after a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerState {
    pub id: String,
    pub created: DateTime<Utc>,
    pub total_memory: u64,
    /// Can be negative transiently while an instance is being torn down.
    pub free_memory: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub model_instances: Vec<ModelInstanceState>,
    /// Recent scheduling decision lines, newest first.
    #[serde(default)]
    pub scheduling_decisions: Vec<String>,
}

/// A successful global scheduling match, kept for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub created: DateTime<Utc>,
    pub runner_id: String,
    pub session_id: String,
    pub interaction_id: String,
    pub model_name: ModelName,
    pub mode: SessionMode,
    pub filter: SessionFilter,
}

/// Everything the dashboard renders in one fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    pub session_queue: Vec<SessionSummary>,
    pub runners: Vec<RunnerState>,
    pub global_scheduling_decisions: Vec<SchedulingDecision>,
}

/// Event kinds pushed to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebsocketEventType {
    SessionUpdate,
    WorkerTaskResponse,
}

/// A single envelope broadcast to clients watching a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketEvent {
    #[serde(rename = "type")]
    pub event_type: WebsocketEventType,
    pub session_id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_task_response: Option<RunnerTaskResponse>,
}
