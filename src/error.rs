use thiserror::Error;

use crate::engine::EngineError;
use crate::workflow::TemplateError;

/// Everything that can end a generation request. The `Display` text is what
/// the caller sees in `{"error": ...}`.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Validation(String),
    #[error("ComfyUI API is not reachable")]
    ReadinessTimeout,
    #[error("Failed to queue workflow: {0}")]
    Submission(#[source] EngineError),
    #[error("Timeout waiting for video generation")]
    PollTimeout,
    #[error("Video generation failed: {0}")]
    ExecutionFailed(String),
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}
