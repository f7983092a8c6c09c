//! Error types for the runner.

/// Errors from runner operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Session preparation failed: {0}")]
    Preparation(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Control plane request failed: {0}")]
    Api(String),

    #[error("Filestore error: {0}")]
    Filestore(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
