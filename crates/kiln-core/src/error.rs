//! Build engine errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build cancelled")]
    Cancelled,

    #[error("circular dependency detected involving build step '{0}'")]
    CycleDetected(String),

    #[error("build step '{0}' has a prerequisite that is not part of the build")]
    UnscheduledPrerequisite(String),

    #[error("build step '{0}' already has a parent")]
    AlreadyParented(String),

    #[error("build step '{0}' cannot contain child steps")]
    NotComposite(String),

    #[error("build step '{0}' has already been processed")]
    AlreadyProcessed(String),

    #[error("build step '{0}' returned NotProcessed after completion")]
    NotProcessed(String),

    #[error("unknown command kind '{0}'")]
    UnknownCommand(String),

    #[error("microthread {id} ({name}) failed: {message}")]
    MicroThread {
        id: u64,
        name: String,
        message: String,
    },

    #[error("an instance of this builder is already running")]
    AlreadyRunning,

    #[error("output file {0} does not exist")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sled::Error),
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Whether an error raised by a command body is a cooperative cancellation
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<BuildError>(), Some(BuildError::Cancelled)))
}
