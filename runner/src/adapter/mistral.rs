//! Adapter for the Mistral-7B-Instruct text model.

use std::path::Path;

use fleet_common::{ModelName, RunnerProcessConfig, RunnerTask, Session, SessionMode};

use crate::error::{Result, RunnerError};
use crate::stream::{JsonLineParser, SentinelTextParser, StreamParser};

use super::{base_env, dataset_dir, task_lora_dir, ChildCommand, ModelAdapter};

pub struct MistralAdapter;

impl ModelAdapter for MistralAdapter {
    fn memory_requirements(&self, mode: SessionMode) -> u64 {
        ModelName::Mistral7bInstruct.memory_requirements(mode)
    }

    fn task(&self, session: &Session) -> Result<RunnerTask> {
        let interaction = session
            .latest_user_interaction()
            .ok_or_else(|| RunnerError::Model(format!("session {} has no prompt", session.id)))?;

        let task = match session.mode {
            SessionMode::Inference => RunnerTask {
                session_id: session.id.clone(),
                prompt: format!("[INST] {} [/INST]", interaction.message),
                lora_dir: task_lora_dir(session),
                dataset_dir: String::new(),
            },
            SessionMode::Finetune => RunnerTask {
                session_id: session.id.clone(),
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
            SessionMode::Inference => "mistral_inference.py",
            SessionMode::Finetune => "mistral_finetune.py",
        };
        Ok(ChildCommand {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), script.to_string()],
            env: base_env(process, mode),
            dir: models_dir.to_path_buf(),
        })
    }

    fn stream_parser(&self, mode: SessionMode) -> Box<dyn StreamParser> {
        match mode {
            // generation is streamed between sentinel markers
            SessionMode::Inference => Box::new(SentinelTextParser::new()),
            // the trainer reports progress as JSON envelopes
            SessionMode::Finetune => Box::new(JsonLineParser),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_common::{Interaction, SessionType, LORA_DIR_NONE};

    fn test_session(mode: SessionMode) -> Session {
        let now = Utc::now();
        let mut user = Interaction::new_user("int-1".to_string(), "prove it".to_string(), now);
        if mode == SessionMode::Finetune {
            user.files = vec!["/workspace/inst/ses/dataset/docs.jsonl".to_string()];
        }
        Session {
            id: "ses-1".to_string(),
            name: String::new(),
            created: now,
            updated: now,
            parent_session: String::new(),
            mode,
            session_type: SessionType::Text,
            model_name: ModelName::Mistral7bInstruct,
            lora_dir: String::new(),
            interactions: vec![user, Interaction::new_system("int-2".to_string(), now)],
            owner: "user-1".to_string(),
            priority: false,
        }
    }

    #[test]
    fn test_inference_task_wraps_prompt() {
        let task = MistralAdapter.task(&test_session(SessionMode::Inference)).unwrap();
        assert_eq!(task.session_id, "ses-1");
        assert_eq!(task.prompt, "[INST] prove it [/INST]");
        assert_eq!(task.dataset_dir, "");
    }

    #[test]
    fn test_finetune_task_points_at_dataset() {
        let task = MistralAdapter.task(&test_session(SessionMode::Finetune)).unwrap();
        assert_eq!(task.prompt, "");
        assert_eq!(task.dataset_dir, "/workspace/inst/ses/dataset");
    }

    #[test]
    fn test_task_collapses_lora_sentinel() {
        let mut session = test_session(SessionMode::Inference);
        session.lora_dir = LORA_DIR_NONE.to_string();
        let task = MistralAdapter.task(&session).unwrap();
        assert_eq!(task.lora_dir, "");
    }

    #[test]
    fn test_command_env_carries_task_urls() {
        let process = RunnerProcessConfig {
            instance_id: "inst-1".to_string(),
            next_task_url: "http://127.0.0.1:8845/api/v1/worker/task/inst-1".to_string(),
            initial_session_url: "http://127.0.0.1:8845/api/v1/worker/initial_session/inst-1"
                .to_string(),
        };
        let command = MistralAdapter
            .command(SessionMode::Inference, &process, Path::new("/opt/models"))
            .unwrap();

        assert_eq!(command.program, "python3");
        assert_eq!(command.args, vec!["-u", "mistral_inference.py"]);
        assert_eq!(command.dir, Path::new("/opt/models"));
        assert!(command
            .env
            .iter()
            .any(|(k, v)| k == "FLEET_NEXT_TASK_URL" && v.ends_with("/task/inst-1")));
        assert!(command
            .env
            .iter()
            .any(|(k, v)| k == "FLEET_INSTANCE_ID" && v == "inst-1"));
    }
}
