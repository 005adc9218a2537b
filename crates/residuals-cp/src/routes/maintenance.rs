use axum::extract::State;
use axum::Json;
use residuals_common::api::{RepairRequest, RepairResponse};
use residuals_common::error::AppResult;

use crate::services::repair::{RepairMode, RepairStep};
use crate::state::AppState;

pub async fn duplicate_mids(
    State(state): State<AppState>,
    Json(payload): Json<RepairRequest>,
) -> AppResult<Json<RepairResponse>> {
    let step: RepairStep = payload.step.parse()?;
    state
        .repair()
        .run(step, RepairMode::from_commit(payload.commit))
        .await
        .map(Json)
}
