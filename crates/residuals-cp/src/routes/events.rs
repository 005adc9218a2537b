use axum::extract::{Path, Query, State};
use axum::Json;
use residuals_common::api::{
    BatchSummary, BulkPayoutMonthRequest, CascadeReport, DeleteEventsResponse, EventIdsRequest, EventListResponse,
    EventQuery, EventStats, HoldEventsRequest, ImportEventsRequest, ImportEventsResponse, RejectDealResponse,
    UpdatedCountResponse,
};
use residuals_common::error::AppResult;
use residuals_common::types::{DealRecord, EventRecord};

use crate::routes::parse_id;
use crate::state::AppState;

pub async fn import(
    State(state): State<AppState>,
    Json(payload): Json<ImportEventsRequest>,
) -> AppResult<Json<ImportEventsResponse>> {
    state.events().import(payload).await.map(Json)
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> AppResult<Json<EventListResponse>> {
    state.events().list(&query).await.map(Json)
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<EventStats>> {
    state.events().stats().await.map(Json)
}

pub async fn batches(State(state): State<AppState>) -> AppResult<Json<Vec<BatchSummary>>> {
    state.events().batches().await.map(Json)
}

pub async fn hold(
    State(state): State<AppState>,
    Json(payload): Json<HoldEventsRequest>,
) -> AppResult<Json<UpdatedCountResponse>> {
    let updated = state.events().hold(&payload).await?;
    Ok(Json(UpdatedCountResponse { updated }))
}

pub async fn release(
    State(state): State<AppState>,
    Json(payload): Json<EventIdsRequest>,
) -> AppResult<Json<UpdatedCountResponse>> {
    let updated = state.events().release(&payload.event_ids).await?;
    Ok(Json(UpdatedCountResponse { updated }))
}

pub async fn payout_month(
    State(state): State<AppState>,
    Json(payload): Json<BulkPayoutMonthRequest>,
) -> AppResult<Json<UpdatedCountResponse>> {
    let updated = state.events().set_payout_month(&payload).await?;
    Ok(Json(UpdatedCountResponse { updated }))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(payload): Json<EventIdsRequest>,
) -> AppResult<Json<DeleteEventsResponse>> {
    state.events().delete_unassigned(&payload.event_ids).await.map(Json)
}

pub async fn reset(State(state): State<AppState>, Path(event_id): Path<String>) -> AppResult<Json<EventRecord>> {
    state.events().reset(parse_id(&event_id)?).await.map(Json)
}

pub async fn reject(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> AppResult<Json<RejectDealResponse>> {
    state.events().reject(parse_id(&event_id)?).await.map(Json)
}

pub async fn force_delete(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> AppResult<Json<CascadeReport>> {
    state.events().force_delete(parse_id(&event_id)?).await.map(Json)
}

pub async fn deal(State(state): State<AppState>, Path(event_id): Path<String>) -> AppResult<Json<DealRecord>> {
    state.deals().for_event(parse_id(&event_id)?).await.map(Json)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use residuals_common::api::{EventListResponse, ImportEventsResponse};
    use tower::ServiceExt;

    use crate::routes::build_router;
    use crate::routes::tests::test_state;

    #[tokio::test]
    async fn import_then_list_pending_queue() {
        let app = build_router(test_state().await);

        let body = serde_json::json!({
            "rows": [
                { "Merchant ID": "22660744", "Merchant Name": "Bakery", "Fees": "$120.50" },
                { "Merchant Name": "No id" }
            ],
            "payout_month": "2024-05"
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events/import")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let imported: ImportEventsResponse = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(imported.imported, 1);
        assert_eq!(imported.errors.len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/events?status=unassigned")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let listed: EventListResponse = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(listed.total, 1);
        assert_eq!(listed.events[0].mid, "22660744");
    }

    #[tokio::test]
    async fn bad_event_id_is_400() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events/not-a-uuid/reset")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
