pub mod deals;
pub mod events;
pub mod health;
pub mod history;
pub mod maintenance;
pub mod payouts;
pub mod sync;

use axum::Router;
use residuals_common::error::{AppError, AppResult};
use uuid::Uuid;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health::health))
        .route("/api/v1/events/import", axum::routing::post(events::import))
        .route("/api/v1/events", axum::routing::get(events::list))
        .route("/api/v1/events/stats", axum::routing::get(events::stats))
        .route("/api/v1/batches", axum::routing::get(events::batches))
        .route("/api/v1/events/hold", axum::routing::post(events::hold))
        .route("/api/v1/events/release", axum::routing::post(events::release))
        .route(
            "/api/v1/events/payout-month",
            axum::routing::post(events::payout_month),
        )
        .route("/api/v1/events/delete", axum::routing::post(events::delete))
        .route(
            "/api/v1/events/{event_id}/reset",
            axum::routing::post(events::reset),
        )
        .route(
            "/api/v1/events/{event_id}/reject",
            axum::routing::post(events::reject),
        )
        .route(
            "/api/v1/events/{event_id}/force-delete",
            axum::routing::post(events::force_delete),
        )
        .route(
            "/api/v1/events/{event_id}/deal",
            axum::routing::get(events::deal),
        )
        .route("/api/v1/deals/assign", axum::routing::post(deals::assign))
        .route(
            "/api/v1/assignments/confirm",
            axum::routing::post(deals::confirm),
        )
        .route("/api/v1/deals", axum::routing::get(deals::list))
        .route(
            "/api/v1/deals/by-mid/{mid}",
            axum::routing::get(deals::by_mid),
        )
        .route(
            "/api/v1/deals/{deal_id}",
            axum::routing::get(deals::get)
                .patch(deals::update)
                .delete(deals::delete),
        )
        .route(
            "/api/v1/deals/{deal_id}/reject",
            axum::routing::post(deals::reject),
        )
        .route("/api/v1/payouts", axum::routing::get(payouts::list))
        .route(
            "/api/v1/payouts/mark-paid",
            axum::routing::post(payouts::mark_paid),
        )
        .route("/api/v1/payouts/months", axum::routing::get(payouts::months))
        .route(
            "/api/v1/payouts/summary/{kind}",
            axum::routing::get(payouts::summary),
        )
        .route(
            "/api/v1/payouts/merchant",
            axum::routing::patch(payouts::update_merchant),
        )
        .route(
            "/api/v1/payouts/{payout_id}",
            axum::routing::patch(payouts::update).delete(payouts::delete),
        )
        .route("/api/v1/sync/status", axum::routing::get(sync::status))
        .route("/api/v1/sync/compare", axum::routing::post(sync::compare))
        .route("/api/v1/sync/apply", axum::routing::post(sync::apply))
        .route("/api/v1/sync/run", axum::routing::post(sync::run))
        .route(
            "/api/v1/sync/config",
            axum::routing::get(sync::get_config).put(sync::put_config),
        )
        .route("/api/v1/history", axum::routing::get(history::list))
        .route(
            "/api/v1/history/{action_id}/undo",
            axum::routing::post(history::undo),
        )
        .route(
            "/api/v1/maintenance/duplicate-mids",
            axum::routing::post(maintenance::duplicate_mids),
        )
        .with_state(state)
}

pub(crate) fn parse_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::InvalidInput(format!("invalid id: {raw}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use residuals_common::config::CpConfig;

    use crate::db::memory_pool;
    use crate::services::audit::HistoryRecorder;
    use crate::state::AppState;
    use crate::stores::history::HistoryStore;
    use crate::stores::setting::SettingsStore;

    pub(crate) async fn test_state() -> AppState {
        let pool = memory_pool().await.expect("pool");
        let config = CpConfig::from_map(&HashMap::new()).expect("config");
        let settings = SettingsStore::new_with_ttl(pool.clone(), Duration::from_secs(5));
        let history = HistoryRecorder::start(HistoryStore::new(pool.clone()));
        AppState::new(
            "boot-test".to_string(),
            Some("sha-test".to_string()),
            config,
            pool,
            settings,
            history,
            None,
        )
    }
}
