//! Supervisor error taxonomy. Public supervisor operations report plain
//! success/failure to callers; the typed variants carry the detail that gets
//! logged before the boolean is returned.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("server '{0}' not found")]
    NotFound(String),

    #[error("server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("server '{0}' is not running")]
    NotRunning(String),

    #[error("no server jar found in {0}")]
    NoArtifact(String),

    #[error("failed to spawn server process: {0}")]
    SpawnFailure(String),

    #[error("empty command")]
    EmptyCommand,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Machine-readable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::NoArtifact(_) => "NO_ARTIFACT",
            Self::SpawnFailure(_) => "SPAWN_FAILURE",
            Self::EmptyCommand => "EMPTY_COMMAND",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
