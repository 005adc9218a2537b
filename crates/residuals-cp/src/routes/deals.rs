use axum::extract::{Path, Query, State};
use axum::Json;
use residuals_common::api::{
    AssignParticipantsRequest, AssignParticipantsResponse, ConfirmEventsResponse, DealListResponse, DealQuery,
    EventIdsRequest, RejectDealResponse, UpdateDealRequest,
};
use residuals_common::error::AppResult;
use residuals_common::types::DealRecord;

use crate::routes::parse_id;
use crate::state::AppState;

pub async fn assign(
    State(state): State<AppState>,
    Json(payload): Json<AssignParticipantsRequest>,
) -> AppResult<Json<AssignParticipantsResponse>> {
    state.deals().assign(payload).await.map(Json)
}

pub async fn confirm(
    State(state): State<AppState>,
    Json(payload): Json<EventIdsRequest>,
) -> AppResult<Json<ConfirmEventsResponse>> {
    state.confirmation().confirm(&payload.event_ids).await.map(Json)
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<DealQuery>,
) -> AppResult<Json<DealListResponse>> {
    state.deals().list(&query).await.map(Json)
}

pub async fn by_mid(State(state): State<AppState>, Path(mid): Path<String>) -> AppResult<Json<DealRecord>> {
    state.deals().by_mid(&mid).await.map(Json)
}

pub async fn get(State(state): State<AppState>, Path(deal_id): Path<String>) -> AppResult<Json<DealRecord>> {
    state.deals().get(parse_id(&deal_id)?).await.map(Json)
}

pub async fn update(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
    Json(payload): Json<UpdateDealRequest>,
) -> AppResult<Json<DealRecord>> {
    state.deals().update(parse_id(&deal_id)?, payload).await.map(Json)
}

pub async fn delete(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
) -> AppResult<Json<RejectDealResponse>> {
    state.deals().delete(parse_id(&deal_id)?).await.map(Json)
}

pub async fn reject(
    State(state): State<AppState>,
    Path(deal_id): Path<String>,
) -> AppResult<Json<RejectDealResponse>> {
    state.deals().reject(parse_id(&deal_id)?).await.map(Json)
}
