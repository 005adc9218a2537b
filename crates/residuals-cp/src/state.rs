use std::sync::Arc;

use residuals_common::config::CpConfig;
use residuals_common::error::{AppError, AppResult};
use sqlx::SqlitePool;

use crate::services::airtable::ExternalPayoutStore;
use crate::services::audit::HistoryRecorder;
use crate::services::confirmation::ConfirmationService;
use crate::services::deals::DealService;
use crate::services::events::EventService;
use crate::services::history::HistoryService;
use crate::services::payouts::PayoutService;
use crate::services::repair::RepairService;
use crate::services::sync::SyncService;
use crate::stores::setting::SettingsStore;

#[derive(Clone)]
pub struct AppState {
    pub boot_id: String,
    pub git_sha: Option<String>,
    pub config: CpConfig,
    pub db_pool: SqlitePool,
    pub settings: SettingsStore,
    pub history: HistoryRecorder,
    /// `None` when no Airtable key is configured.
    pub external: Option<Arc<dyn ExternalPayoutStore>>,
}

impl AppState {
    pub fn new(
        boot_id: String,
        git_sha: Option<String>,
        config: CpConfig,
        db_pool: SqlitePool,
        settings: SettingsStore,
        history: HistoryRecorder,
        external: Option<Arc<dyn ExternalPayoutStore>>,
    ) -> Self {
        Self {
            boot_id,
            git_sha,
            config,
            db_pool,
            settings,
            history,
            external,
        }
    }

    pub fn events(&self) -> EventService {
        EventService::new(self.db_pool.clone(), self.history.clone())
    }

    pub fn deals(&self) -> DealService {
        DealService::new(self.db_pool.clone(), self.history.clone())
    }

    pub fn confirmation(&self) -> ConfirmationService {
        ConfirmationService::new(
            self.db_pool.clone(),
            self.history.clone(),
            self.sync_service(),
            self.config.block_held_confirm,
        )
    }

    pub fn payouts(&self) -> PayoutService {
        PayoutService::new(self.db_pool.clone(), self.history.clone(), self.config.local_page_size)
    }

    pub fn history_service(&self) -> HistoryService {
        HistoryService::new(self.db_pool.clone(), self.history.clone())
    }

    pub fn repair(&self) -> RepairService {
        RepairService::new(self.db_pool.clone(), self.history.clone())
    }

    pub fn sync_service(&self) -> Option<SyncService> {
        self.external
            .as_ref()
            .map(|external| SyncService::new(self.db_pool.clone(), external.clone(), &self.config))
    }

    pub fn require_sync(&self) -> AppResult<SyncService> {
        self.sync_service()
            .ok_or_else(|| AppError::Config("external sync partner is not configured".to_string()))
    }
}
