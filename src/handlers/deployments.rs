use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::error::EngineError;
use crate::handlers::engine_error;
use crate::models::deployment::{DeployProdRequest, MANUAL_ACTOR, RollbackRequest};

/// Promote preprod's current versions to production.
pub async fn deploy_prod(
    State(state): State<AppState>,
    Json(req): Json<DeployProdRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !req.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            "Deployment requires confirmation".to_string(),
        ));
    }
    let result = state
        .engine
        .promote(req.services.as_deref(), MANUAL_ACTOR)
        .await
        .map_err(engine_error)?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(deployment_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.engine.get_status(deployment_id).map_err(engine_error)? {
        Some(status) => Ok(Json(status)),
        None => Err((StatusCode::NOT_FOUND, "Deployment not found".to_string())),
    }
}

pub async fn rollback_prod(
    State(state): State<AppState>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !req.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            "Rollback requires confirmation".to_string(),
        ));
    }
    let Some(history_id) = req.deployment_history_id else {
        return Err((
            StatusCode::BAD_REQUEST,
            "deployment_history_id is required".to_string(),
        ));
    };
    let result = state
        .engine
        .rollback(history_id, MANUAL_ACTOR)
        .await
        .map_err(|e| match e {
            EngineError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "Production deployment record not found".to_string(),
            ),
            other => engine_error(other),
        })?;
    Ok(Json(result))
}
