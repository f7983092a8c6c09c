//! Adapter for the SDXL image model.

use std::path::Path;

use fleet_common::{ModelName, RunnerProcessConfig, RunnerTask, Session, SessionMode};

use crate::error::{Result, RunnerError};
use crate::stream::{JsonLineParser, StreamParser};

use super::{base_env, dataset_dir, task_lora_dir, ChildCommand, ModelAdapter};

pub struct SdxlAdapter;

impl ModelAdapter for SdxlAdapter {
    fn memory_requirements(&self, mode: SessionMode) -> u64 {
        ModelName::StableDiffusionXl.memory_requirements(mode)
    }

    fn task(&self, session: &Session) -> Result<RunnerTask> {
        let interaction = session
            .latest_user_interaction()
            .ok_or_else(|| RunnerError::Model(format!("session {} has no prompt", session.id)))?;

        let task = match session.mode {
            SessionMode::Inference => RunnerTask {
                session_id: session.id.clone(),
                prompt: interaction.message.clone(),
                lora_dir: task_lora_dir(session),
                dataset_dir: String::new(),
            },
            SessionMode::Finetune => RunnerTask {
                session_id: session.id.clone(),
                // image fine-tunes caption from metadata, not a prompt
                prompt: String::new(),
                lora_dir: task_lora_dir(session),
                dataset_dir: dataset_dir(session),
            },
        };
        Ok(task)
    }

    fn command(
        &self,
        mode: SessionMode,
        process: &RunnerProcessConfig,
        models_dir: &Path,
    ) -> Result<ChildCommand> {
        let script = match mode {
            SessionMode::Inference => "sdxl_inference.py",
            SessionMode::Finetune => "sdxl_finetune.py",
        };
        Ok(ChildCommand {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), script.to_string()],
            env: base_env(process, mode),
            dir: models_dir.to_path_buf(),
        })
    }

    fn stream_parser(&self, _mode: SessionMode) -> Box<dyn StreamParser> {
        // both generation and training report JSON envelopes; images come
        // back as result files, not streamed text
        Box::new(JsonLineParser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_common::{Interaction, SessionType};

    #[test]
    fn test_inference_task_uses_raw_prompt() {
        let now = Utc::now();
        let session = Session {
            id: "ses-1".to_string(),
            name: String::new(),
            created: now,
            updated: now,
            parent_session: String::new(),
            mode: SessionMode::Inference,
            session_type: SessionType::Image,
            model_name: ModelName::StableDiffusionXl,
            lora_dir: String::new(),
            interactions: vec![
                Interaction::new_user("int-1".to_string(), "a red fox".to_string(), now),
                Interaction::new_system("int-2".to_string(), now),
            ],
            owner: "user-1".to_string(),
            priority: false,
        };

        let task = SdxlAdapter.task(&session).unwrap();
        assert_eq!(task.prompt, "a red fox");
    }

    #[test]
    fn test_command_scripts_per_mode() {
        let process = RunnerProcessConfig {
            instance_id: "inst-1".to_string(),
            next_task_url: "http://localhost/task/inst-1".to_string(),
            initial_session_url: "http://localhost/initial_session/inst-1".to_string(),
        };
        let inference = SdxlAdapter
            .command(SessionMode::Inference, &process, Path::new("/opt/models"))
            .unwrap();
        assert_eq!(inference.args[1], "sdxl_inference.py");

        let finetune = SdxlAdapter
            .command(SessionMode::Finetune, &process, Path::new("/opt/models"))
            .unwrap();
        assert_eq!(finetune.args[1], "sdxl_finetune.py");
    }
}
