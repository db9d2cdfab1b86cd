use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::AppState;
use crate::diff::commit_range;
use crate::handlers::engine_error;
use crate::models::deployment::Environment;

pub async fn list_environments(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let states = state.engine.environment_states().map_err(engine_error)?;
    Ok(Json(states))
}

pub async fn get_diff(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let changes = state.engine.diff_environments().map_err(engine_error)?;
    let states = state.engine.environment_states().map_err(engine_error)?;
    let range = commit_range(
        states.get(&Environment::Prod),
        states.get(&Environment::Preprod),
    );
    Ok(Json(serde_json::json!({
        "changes": changes,
        "commit_range": range,
    })))
}
