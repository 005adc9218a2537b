use axum::extract::State;
use axum::Json;
use residuals_common::api::{SyncConfigResponse, SyncRequest, SyncStatusResponse, UpdateSyncConfigRequest};
use residuals_common::error::AppResult;
use residuals_common::types::{ActionType, EntityType};
use serde_json::{json, Value};
use tracing::info;

use crate::services::sync::{status_counts, ApplySyncRequest, SyncApplyResult, SyncComparison, SyncRunResult};
use crate::state::AppState;
use crate::stores::history::NewAction;
use crate::stores::payout::PayoutStore;
use crate::stores::setting::{AIRTABLE_BASE_ID, AIRTABLE_TABLE_ID};

pub async fn status(State(state): State<AppState>) -> AppResult<Json<SyncStatusResponse>> {
    match state.sync_service() {
        Some(sync) => sync.status().await.map(Json),
        None => status_counts(&PayoutStore::new(state.db_pool.clone()), false)
            .await
            .map(Json),
    }
}

pub async fn compare(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> AppResult<Json<SyncComparison>> {
    state.require_sync()?.compare(payload.month.as_deref()).await.map(Json)
}

pub async fn apply(
    State(state): State<AppState>,
    Json(payload): Json<ApplySyncRequest>,
) -> AppResult<Json<SyncApplyResult>> {
    Ok(Json(state.require_sync()?.apply(&payload).await))
}

pub async fn run(State(state): State<AppState>, Json(payload): Json<SyncRequest>) -> AppResult<Json<SyncRunResult>> {
    state.require_sync()?.run(payload.month.as_deref()).await.map(Json)
}

pub async fn get_config(State(state): State<AppState>) -> AppResult<Json<SyncConfigResponse>> {
    current_config(&state).await.map(Json)
}

/// Blank values clear the override so the environment value applies again.
pub async fn put_config(
    State(state): State<AppState>,
    Json(payload): Json<UpdateSyncConfigRequest>,
) -> AppResult<Json<SyncConfigResponse>> {
    let before = current_config(&state).await?;
    for (key, value) in [(AIRTABLE_BASE_ID, &payload.base_id), (AIRTABLE_TABLE_ID, &payload.table_id)] {
        match value.as_deref().map(str::trim) {
            None => {}
            Some("") => state.settings.delete(key).await?,
            Some(v) => state.settings.put(key, &Value::String(v.to_string()), false).await?,
        }
    }
    let after = current_config(&state).await?;

    info!(base_id = ?after.base_id, table_id = ?after.table_id, "sync config updated");
    state.history.record(
        NewAction::new(ActionType::Update, EntityType::Setting, "airtable", "Updated external sync table")
            .previous(Some(json!(before)))
            .new_data(Some(json!(after))),
    );
    Ok(Json(after))
}

async fn current_config(state: &AppState) -> AppResult<SyncConfigResponse> {
    let fallback = state.config.airtable.as_ref();
    let base_id = match state.settings.get_string(AIRTABLE_BASE_ID).await? {
        Some(v) => Some(v),
        None => fallback.and_then(|a| a.base_id.clone()),
    };
    let table_id = match state.settings.get_string(AIRTABLE_TABLE_ID).await? {
        Some(v) => Some(v),
        None => fallback.and_then(|a| a.table_id.clone()),
    };
    Ok(SyncConfigResponse { base_id, table_id })
}
