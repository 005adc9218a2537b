pub mod background;
pub mod db;
pub mod routes;
pub mod services;
pub mod state;
pub mod stores;

use std::sync::Arc;

use residuals_common::config::CpConfig;
use residuals_common::error::{AppError, AppResult};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::connect_and_migrate;
use crate::services::airtable::{AirtableClient, ExternalPayoutStore};
use crate::services::audit::HistoryRecorder;
use crate::state::AppState;
use crate::stores::history::HistoryStore;
use crate::stores::setting::SettingsStore;

/// Connect, migrate and wire every shared handle. Must run inside a tokio
/// runtime because the history writer is spawned here.
pub async fn state_from_config(config: CpConfig, boot_id: String, git_sha: Option<String>) -> AppResult<AppState> {
    let pool = connect_and_migrate(&config.database_url).await?;
    state_from_pool(config, pool, boot_id, git_sha)
}

pub fn state_from_pool(
    config: CpConfig,
    pool: SqlitePool,
    boot_id: String,
    git_sha: Option<String>,
) -> AppResult<AppState> {
    let settings = SettingsStore::new(pool.clone());
    let history = HistoryRecorder::start(HistoryStore::new(pool.clone()));
    let external: Option<Arc<dyn ExternalPayoutStore>> = match &config.airtable {
        Some(airtable) => Some(Arc::new(AirtableClient::new(airtable.clone(), settings.clone())?)),
        None => {
            info!("AIRTABLE_API_KEY not set; external sync disabled");
            None
        }
    };
    Ok(AppState::new(boot_id, git_sha, config, pool, settings, history, external))
}

pub async fn serve(state: AppState) -> AppResult<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Config(format!("bind {bind_addr} failed: {e}")))?;
    info!(%bind_addr, "listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::Persistence(format!("server error: {e}")))
}
