//! Fleet Common Types
//!
//! Shared types used by both the runner and the control plane.

pub mod filter;
pub mod model;
pub mod session;
pub mod state;
pub mod task;

pub use filter::{RejectEntry, SessionFilter, LORA_DIR_NONE};
pub use model::ModelName;
pub use session::{
    CreatorType, Interaction, InteractionState, Session, SessionMode, SessionSummary, SessionType,
};
pub use state::{
    DashboardData, ModelInstanceState, RunnerState, SchedulingDecision, WebsocketEvent,
    WebsocketEventType,
};
pub use task::{RunnerProcessConfig, RunnerTask, RunnerTaskResponse, TaskResponseType};
