//! Session filters.
//!
//! A filter is what a runner sends when polling for work: the constraints
//! under which it can accept a session. The control plane's queue evaluates
//! the predicate; both sides share the exact semantics here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ModelName;
use crate::session::{Session, SessionMode, SessionType};

/// Sentinel meaning "this session explicitly has no fine-tune artifact".
///
/// Distinct from the empty string, which in a filter means "don't care".
/// The two MUST be preserved bit-for-bit across the wire.
pub const LORA_DIR_NONE: &str = "none";

/// A (model, mode) pair a runner refuses to accept another copy of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectEntry {
    pub model_name: ModelName,
    pub mode: SessionMode,
}

/// Constraints a runner advertises when asking for a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub session_type: Option<SessionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<ModelName>,
    /// Empty: don't care. [`LORA_DIR_NONE`]: only sessions with no
    /// fine-tune artifact. Anything else: exact match.
    #[serde(default)]
    pub lora_dir: String,
    /// Only accept sessions whose model fits in this much memory.
    /// Zero disables the check (used by warm filters, where the model is
    /// already loaded).
    #[serde(default)]
    pub memory: u64,
    /// Model/mode combinations to skip over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reject: Vec<RejectEntry>,
    /// Only accept sessions created at least this many seconds ago.
    #[serde(default)]
    pub older_secs: u64,
}

impl SessionFilter {
    /// Whether `session` satisfies every constraint of this filter at `now`.
    pub fn matches(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if let Some(mode) = self.mode {
            if mode != session.mode {
                return false;
            }
        }
        if let Some(session_type) = self.session_type {
            if session_type != session.session_type {
                return false;
            }
        }
        if let Some(model_name) = self.model_name {
            if model_name != session.model_name {
                return false;
            }
        }
        if !lora_matches(&self.lora_dir, &session.lora_dir) {
            return false;
        }
        if self.memory > 0 && session.model_name.memory_requirements(session.mode) > self.memory {
            return false;
        }
        if self
            .reject
            .iter()
            .any(|r| r.model_name == session.model_name && r.mode == session.mode)
        {
            return false;
        }
        if self.older_secs > 0 {
            let age = now.signed_duration_since(session.created);
            if age < chrono::Duration::seconds(self.older_secs as i64) {
                return false;
            }
        }
        true
    }
}

/// The lora dir matching rule.
///
/// Empty filter value matches anything. [`LORA_DIR_NONE`] matches only
/// sessions whose lora dir is empty or the sentinel itself. Any other value
/// is an exact string match.
pub fn lora_matches(filter: &str, session: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    if filter == LORA_DIR_NONE {
        return session.is_empty() || session == LORA_DIR_NONE;
    }
    filter == session
}
