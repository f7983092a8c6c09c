//! Session and interaction types.
//!
//! A session is a conversational thread bound to one model and mode. It is
//! created by the API, queued on the control plane, and handed to a model
//! instance on a runner which fills in the final system interaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ModelName;

/// What a session asks the model to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Inference,
    Finetune,
}

/// The payload family a session works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Text,
    Image,
}

/// Who authored an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorType {
    User,
    System,
}

/// Progress state of a single interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    Waiting,
    Editing,
    Complete,
    Error,
}

/// One message within a session.
///
/// Within a session's interaction list, the final system interaction is the
/// one the active task is filling in; all prior interactions are complete or
/// errored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    pub creator: CreatorType,
    /// ID of the runner that processed this interaction.
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub message: String,
    /// 0-100.
    #[serde(default)]
    pub progress: u8,
    /// Filestore paths attached to this interaction.
    #[serde(default)]
    pub files: Vec<String>,
    /// True once the message has finished being written to.
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub state: InteractionState,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    /// Hoisted from files so a single interaction knows it produced a
    /// fine-tune artifact.
    #[serde(default)]
    pub lora_dir: String,
}

impl Interaction {
    /// A fresh system interaction awaiting a task response.
    pub fn new_system(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created: now,
            updated: now,
            scheduled: None,
            completed: None,
            creator: CreatorType::System,
            runner: String::new(),
            message: String::new(),
            progress: 0,
            files: vec![],
            finished: false,
            metadata: HashMap::new(),
            state: InteractionState::Waiting,
            status: String::new(),
            error: String::new(),
            lora_dir: String::new(),
        }
    }

    /// A finished user interaction carrying a prompt.
    pub fn new_user(id: String, message: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created: now,
            updated: now,
            scheduled: None,
            completed: None,
            creator: CreatorType::User,
            runner: String::new(),
            message,
            progress: 0,
            files: vec![],
            finished: true,
            metadata: HashMap::new(),
            state: InteractionState::Complete,
            status: String::new(),
            error: String::new(),
            lora_dir: String::new(),
        }
    }
}

/// A conversational thread bound to one model and mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub parent_session: String,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub model_name: ModelName,
    /// Filestore path of a fine-tune artifact. Empty string means the
    /// session has none; see [`crate::filter::LORA_DIR_NONE`] for the
    /// explicit sentinel used in filters.
    #[serde(default)]
    pub lora_dir: String,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    pub owner: String,
    /// Priority sessions are served ahead of the rest of the queue.
    #[serde(default)]
    pub priority: bool,
}

impl Session {
    /// The most recent user interaction. This is what a task's prompt and
    /// input files are taken from.
    pub fn latest_user_interaction(&self) -> Option<&Interaction> {
        self.interactions
            .iter()
            .rev()
            .find(|i| i.creator == CreatorType::User)
    }

    /// The final system interaction, i.e. the one the active task is
    /// filling in.
    pub fn working_interaction(&self) -> Option<&Interaction> {
        self.interactions
            .iter()
            .rev()
            .find(|i| i.creator == CreatorType::System)
    }

    /// Mutable access to the working interaction.
    pub fn working_interaction_mut(&mut self) -> Option<&mut Interaction> {
        self.interactions
            .iter_mut()
            .rev()
            .find(|i| i.creator == CreatorType::System)
    }

    /// Short dashboard row for this session.
    pub fn summary(&self) -> SessionSummary {
        let prompt = self
            .latest_user_interaction()
            .map(|i| i.message.as_str())
            .unwrap_or("");
        let summary = if prompt.len() > 80 {
            // truncate on a char boundary
            let mut end = 80;
            while !prompt.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &prompt[..end])
        } else {
            prompt.to_string()
        };
        let working = self.working_interaction();
        SessionSummary {
            created: self.created,
            updated: self.updated,
            scheduled: working.and_then(|i| i.scheduled),
            completed: working.and_then(|i| i.completed),
            session_id: self.id.clone(),
            name: self.name.clone(),
            interaction_id: working.map(|i| i.id.clone()).unwrap_or_default(),
            model_name: self.model_name,
            mode: self.mode,
            session_type: self.session_type,
            owner: self.owner.clone(),
            lora_dir: self.lora_dir.clone(),
            summary,
            priority: self.priority,
        }
    }
}

/// A short version of a session kept for the dashboard and job history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    pub session_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub interaction_id: String,
    pub model_name: ModelName,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lora_dir: String,
    /// Either the prompt or a summary of the training data.
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub priority: bool,
}
