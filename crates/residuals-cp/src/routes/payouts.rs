use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use residuals_common::api::{
    MarkPaidRequest, MarkPaidResponse, PayoutListResponse, PayoutQuery, UpdateMerchantRequest,
    UpdateMerchantResponse, UpdatePayoutRequest,
};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::PayoutRecord;
use serde_json::Value;

use crate::routes::parse_id;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<PayoutQuery>,
) -> AppResult<Json<PayoutListResponse>> {
    state.payouts().list(&query).await.map(Json)
}

pub async fn update(
    State(state): State<AppState>,
    Path(payout_id): Path<String>,
    Json(payload): Json<UpdatePayoutRequest>,
) -> AppResult<Json<PayoutRecord>> {
    state.payouts().update(parse_id(&payout_id)?, &payload).await.map(Json)
}

pub async fn delete(State(state): State<AppState>, Path(payout_id): Path<String>) -> AppResult<StatusCode> {
    state.payouts().delete(parse_id(&payout_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_paid(
    State(state): State<AppState>,
    Json(payload): Json<MarkPaidRequest>,
) -> AppResult<Json<MarkPaidResponse>> {
    state.payouts().mark_paid(&payload).await.map(Json)
}

pub async fn months(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    state.payouts().months().await.map(Json)
}

pub async fn summary(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<PayoutQuery>,
) -> AppResult<Json<Value>> {
    let service = state.payouts();
    let value = match kind.as_str() {
        "monthly" => serde_json::to_value(service.monthly_summary(&query).await?),
        "quarterly" => serde_json::to_value(service.quarterly_summary(&query).await?),
        "participants" => serde_json::to_value(service.participant_summary(&query).await?),
        other => return Err(AppError::NotFound(format!("unknown summary: {other}"))),
    };
    value
        .map(Json)
        .map_err(|e| AppError::Persistence(format!("summary serialize failed: {e}")))
}

pub async fn update_merchant(
    State(state): State<AppState>,
    Json(payload): Json<UpdateMerchantRequest>,
) -> AppResult<Json<UpdateMerchantResponse>> {
    state.payouts().update_merchant(&payload).await.map(Json)
}
