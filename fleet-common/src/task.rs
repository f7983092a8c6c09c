//! Runner tasks and task responses.
//!
//! A task is the unit a model instance's child process consumes for one
//! session turn; a task response is one envelope the child emits back while
//! working on it.

use serde::{Deserialize, Serialize};

/// The kind of a task response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResponseType {
    /// A chunk of streamed output text.
    Stream,
    /// A progress update (fine-tune epochs, image steps).
    Progress,
    /// The terminal envelope. Exactly one per session run.
    Result,
}

/// The unit a child process executes for one session turn.
///
/// Its job is to take the most recent user interaction and fill in the
/// message and/or files of the final system interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerTask {
    pub session_id: String,
    /// The prompt fed into the model.
    #[serde(default)]
    pub prompt: String,
    /// Local directory containing the fine-tune artifact to load, if any.
    #[serde(default)]
    pub lora_dir: String,
    /// Local directory containing the input files for a fine-tune run.
    #[serde(default)]
    pub dataset_dir: String,
}

/// One envelope emitted by a child process while running a task.
///
/// Per session exactly one `result` (or error) is emitted and is terminal;
/// `stream` and `progress` may be emitted zero or more times before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerTaskResponse {
    #[serde(rename = "type")]
    pub response_type: TaskResponseType,
    pub session_id: String,
    /// The latest system interaction, filled in by the model instance.
    #[serde(default)]
    pub interaction_id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lora_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

impl RunnerTaskResponse {
    /// A terminal error envelope for a session.
    pub fn error(session_id: String, error: String) -> Self {
        Self {
            response_type: TaskResponseType::Result,
            session_id,
            interaction_id: String::new(),
            owner: String::new(),
            message: String::new(),
            progress: 0,
            status: String::new(),
            files: vec![],
            lora_dir: String::new(),
            error,
            done: true,
        }
    }

    /// Whether this is the terminal envelope for its session.
    pub fn is_terminal(&self) -> bool {
        self.response_type == TaskResponseType::Result
    }
}

/// Environment handed to a child process so it can reach its instance's
/// task endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerProcessConfig {
    pub instance_id: String,
    /// Pops the next task from the instance.
    pub next_task_url: String,
    /// Read-only view of the current or queued session, so the child can
    /// load the right fine-tune file before work starts.
    pub initial_session_url: String,
}
