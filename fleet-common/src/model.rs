//! The model catalog.
//!
//! The fleet serves a fixed, known set of models. Keeping the set closed
//! lets both sides of the wire agree on memory footprints without a lookup
//! service, and lets the runner dispatch to a concrete adapter per model.

use serde::{Deserialize, Serialize};

use crate::session::{SessionMode, SessionType};

const GIB: u64 = 1024 * 1024 * 1024;

/// A model the fleet knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelName {
    #[serde(rename = "mistralai/Mistral-7B-Instruct-v0.1")]
    Mistral7bInstruct,
    #[serde(rename = "stabilityai/stable-diffusion-xl-base-1.0")]
    StableDiffusionXl,
}

impl ModelName {
    /// Every model in the catalog.
    pub const ALL: [ModelName; 2] = [ModelName::Mistral7bInstruct, ModelName::StableDiffusionXl];

    /// GPU memory needed to run this model in the given mode, in bytes.
    pub fn memory_requirements(&self, mode: SessionMode) -> u64 {
        match (self, mode) {
            (ModelName::Mistral7bInstruct, SessionMode::Inference) => 14 * GIB,
            (ModelName::Mistral7bInstruct, SessionMode::Finetune) => 22 * GIB,
            (ModelName::StableDiffusionXl, SessionMode::Inference) => 16 * GIB,
            (ModelName::StableDiffusionXl, SessionMode::Finetune) => 24 * GIB,
        }
    }

    /// The payload family this model works with.
    pub fn session_type(&self) -> SessionType {
        match self {
            ModelName::Mistral7bInstruct => SessionType::Text,
            ModelName::StableDiffusionXl => SessionType::Image,
        }
    }

    /// The smallest footprint any (model, mode) combination needs.
    ///
    /// Runners use this as an early "full" check: if free memory is below
    /// this there is no point polling for work.
    pub fn lowest_memory_requirement() -> u64 {
        let mut lowest = u64::MAX;
        for model in ModelName::ALL {
            for mode in [SessionMode::Inference, SessionMode::Finetune] {
                let req = model.memory_requirements(mode);
                if req > 0 && req < lowest {
                    lowest = req;
                }
            }
        }
        lowest
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelName::Mistral7bInstruct => "mistralai/Mistral-7B-Instruct-v0.1",
            ModelName::StableDiffusionXl => "stabilityai/stable-diffusion-xl-base-1.0",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_uses_full_names() {
        let json = serde_json::to_string(&ModelName::Mistral7bInstruct).unwrap();
        assert_eq!(json, r#""mistralai/Mistral-7B-Instruct-v0.1""#);

        let parsed: ModelName =
            serde_json::from_str(r#""stabilityai/stable-diffusion-xl-base-1.0""#).unwrap();
        assert_eq!(parsed, ModelName::StableDiffusionXl);
    }

    #[test]
    fn test_display_matches_wire_format() {
        for model in ModelName::ALL {
            let json = serde_json::to_string(&model).unwrap();
            assert_eq!(json, format!("\"{}\"", model));
        }
    }

    #[test]
    fn test_finetune_needs_more_than_inference() {
        for model in ModelName::ALL {
            assert!(
                model.memory_requirements(SessionMode::Finetune)
                    > model.memory_requirements(SessionMode::Inference)
            );
        }
    }

    #[test]
    fn test_lowest_memory_requirement() {
        assert_eq!(ModelName::lowest_memory_requirement(), 14 * GIB);
    }
}
