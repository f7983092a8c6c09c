//! Per-model adapters.
//!
//! Different models need different launch commands, report different memory
//! footprints and frame their stdout differently. Each model in the catalog
//! gets one adapter implementing this trait; dispatch is over the closed
//! [`ModelName`] set, never an open registry.

mod mistral;
mod sdxl;

pub use mistral::MistralAdapter;
pub use sdxl::SdxlAdapter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_common::{ModelName, RunnerProcessConfig, RunnerTask, Session, SessionMode};

use crate::error::Result;
use crate::stream::StreamParser;

/// A fully described child process launch: argv, environment and working
/// directory. The instance turns this into a real process.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: PathBuf,
}

/// What the runner needs from a model: its footprint, how to turn a session
/// into a task, how to launch its runtime, and how to parse its output.
pub trait ModelAdapter: Send + Sync {
    /// GPU memory needed to run this model in the given mode, in bytes.
    fn memory_requirements(&self, mode: SessionMode) -> u64;

    /// Translate a session into the task its child process consumes,
    /// selecting prompt and paths from the latest user interaction.
    fn task(&self, session: &Session) -> Result<RunnerTask>;

    /// The command that launches this model's runtime for the given mode.
    fn command(
        &self,
        mode: SessionMode,
        process: &RunnerProcessConfig,
        models_dir: &Path,
    ) -> Result<ChildCommand>;

    /// Parser for this model's stdout framing in the given mode.
    fn stream_parser(&self, mode: SessionMode) -> Box<dyn StreamParser>;
}

/// The adapter for a catalog model.
pub fn adapter_for(model: ModelName) -> Arc<dyn ModelAdapter> {
    match model {
        ModelName::Mistral7bInstruct => Arc::new(MistralAdapter),
        ModelName::StableDiffusionXl => Arc::new(SdxlAdapter),
    }
}

/// Environment shared by every model runtime.
pub(crate) fn base_env(process: &RunnerProcessConfig, mode: SessionMode) -> Vec<(String, String)> {
    vec![
        (
            "FLEET_INSTANCE_ID".to_string(),
            process.instance_id.clone(),
        ),
        (
            "FLEET_NEXT_TASK_URL".to_string(),
            process.next_task_url.clone(),
        ),
        (
            "FLEET_INITIAL_SESSION_URL".to_string(),
            process.initial_session_url.clone(),
        ),
        (
            "FLEET_MODE".to_string(),
            match mode {
                SessionMode::Inference => "inference".to_string(),
                SessionMode::Finetune => "finetune".to_string(),
            },
        ),
    ]
}

/// The dataset directory for a fine-tune session: where its staged input
/// files live.
pub(crate) fn dataset_dir(session: &Session) -> String {
    session
        .latest_user_interaction()
        .and_then(|i| i.files.first())
        .and_then(|f| {
            Path::new(f)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}

/// The fine-tune artifact path to hand to the child, with the sentinel
/// collapsed to "no artifact".
pub(crate) fn task_lora_dir(session: &Session) -> String {
    if session.lora_dir == fleet_common::LORA_DIR_NONE {
        String::new()
    } else {
        session.lora_dir.clone()
    }
}
