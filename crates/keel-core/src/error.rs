//! Error types for Keel CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors (fatal before scheduling)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid predicate `{expression}`: {reason}")]
    Predicate { expression: String, reason: String },

    // Execution errors
    #[error("Stage {stage} failed: {reason}")]
    StageFailure { stage: String, reason: String },

    #[error("No worker can ever run stage {stage} (selector: {selector})")]
    SchedulingStarvation { stage: String, selector: String },

    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    // Aggregation errors
    #[error("Artifact key collision on {key}: produced by {first} and {second}")]
    ArtifactCollision {
        key: String,
        first: String,
        second: String,
    },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors raised while resolving configuration, before any stage runs.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Predicate { .. })
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
