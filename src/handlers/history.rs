use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::AppState;
use crate::handlers::engine_error;
use crate::models::deployment::{Environment, HistoryFilter, HistoryQuery};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

fn history_filter(query: &HistoryQuery) -> Result<(HistoryFilter, i64, i64), String> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(format!("limit must be between 1 and {MAX_LIMIT}"));
    }
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err("offset must not be negative".to_string());
    }
    let environment = match query.environment.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(raw.parse::<Environment>().map_err(|e| e.to_string())?),
    };
    let filter = HistoryFilter {
        environment,
        service: query.service.clone(),
    };
    Ok((filter, limit, offset))
}

pub async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (filter, limit, offset) =
        history_filter(&query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let (deployments, total) = state
        .engine
        .list_history(&filter, limit, offset)
        .map_err(engine_error)?;
    Ok(Json(serde_json::json!({
        "deployments": deployments,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

/// One history entry plus the other services deployed in the same group.
pub async fn get_history_entry(
    State(state): State<AppState>,
    Path(history_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(entry) = state.engine.history_entry(history_id).map_err(engine_error)? else {
        return Err((StatusCode::NOT_FOUND, "History entry not found".to_string()));
    };
    let related = state
        .engine
        .related_history(entry.environment, entry.started_at)
        .map_err(engine_error)?;
    Ok(Json(serde_json::json!({
        "entry": entry,
        "related": related,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(limit: Option<i64>, environment: Option<&str>) -> HistoryQuery {
        HistoryQuery {
            environment: environment.map(str::to_string),
            service: None,
            limit,
            offset: None,
        }
    }

    #[test]
    fn test_history_filter_defaults_and_bounds() {
        let (filter, limit, offset) = history_filter(&query(None, None)).unwrap();
        assert_eq!((limit, offset), (50, 0));
        assert!(filter.environment.is_none());

        assert!(history_filter(&query(Some(0), None)).is_err());
        assert!(history_filter(&query(Some(201), None)).is_err());
        assert_eq!(history_filter(&query(Some(200), None)).unwrap().1, 200);
    }

    #[test]
    fn test_history_filter_environment() {
        let (filter, _, _) = history_filter(&query(None, Some("prod"))).unwrap();
        assert_eq!(filter.environment, Some(Environment::Prod));
        assert!(history_filter(&query(None, Some("staging"))).is_err());
        let (filter, _, _) = history_filter(&query(None, Some("all"))).unwrap();
        assert!(filter.environment.is_none());
    }
}
