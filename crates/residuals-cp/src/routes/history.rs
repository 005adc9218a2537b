use axum::extract::{Path, Query, State};
use axum::Json;
use residuals_common::api::{HistoryQuery, UndoResponse};
use residuals_common::error::AppResult;
use residuals_common::types::ActionRecord;

use crate::routes::parse_id;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<ActionRecord>>> {
    state.history_service().list(&query).await.map(Json)
}

pub async fn undo(State(state): State<AppState>, Path(action_id): Path<String>) -> AppResult<Json<UndoResponse>> {
    state.history_service().undo(parse_id(&action_id)?).await.map(Json)
}
