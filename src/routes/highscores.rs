//! REST handler for the highscore list.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde::Deserialize;

use crate::services::highscore::{self, HighscoreRow};
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

/// `GET /api/highscores?limit=N` — top sessions by stroke count.
pub async fn list_highscores(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<HighscoreRow>>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    match highscore::list_highscores(&state.pool, limit).await {
        Ok(rows) => Ok(Json(rows)),
        Err(e) => {
            tracing::error!(error = %e, "highscore list failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
