pub mod deployments;
pub mod environments;
pub mod health;
pub mod history;

use axum::http::StatusCode;

use crate::error::EngineError;

/// Map engine errors onto HTTP status codes.
pub(crate) fn engine_error(e: EngineError) -> (StatusCode, String) {
    let status = match &e {
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::ConflictInProgress { .. } | EngineError::NotDeployed(_) => {
            StatusCode::CONFLICT
        }
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Store(_) => {
            tracing::error!("request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}
