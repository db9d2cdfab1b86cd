use thiserror::Error;

use crate::models::deployment::Environment;

/// Errors surfaced by the deployment engine to its callers.
///
/// Orchestrator failures are not in here: a failed stack deploy is recorded in
/// history and returned as a `failed` status.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("deployment already in progress for {environment}")]
    ConflictInProgress { environment: Environment },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} environment has not been deployed yet")]
    NotDeployed(Environment),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("container platform unavailable: {0}")]
    Unavailable(String),

    #[error("stack deploy failed: {0}")]
    CommandFailed(String),

    #[error("failed to render stack: {0}")]
    Render(String),

    #[error("stack deploy timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed manifest payload: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ManifestError {
    fn from(e: reqwest::Error) -> Self {
        ManifestError::Transport(e.to_string())
    }
}
