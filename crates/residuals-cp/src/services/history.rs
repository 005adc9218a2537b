use residuals_common::api::{HistoryQuery, UndoResponse};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::{ActionRecord, ActionType, Snapshot};
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::audit::HistoryRecorder;
use crate::stores::deal::DealStore;
use crate::stores::event::EventStore;
use crate::stores::history::{HistoryFilter, HistoryStore, NewAction};
use crate::stores::payout::PayoutStore;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

/// Rows an action inserted. Undo removes them after writing the snapshot back.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreatedRows {
    created_deal_ids: Vec<Uuid>,
    created_event_ids: Vec<Uuid>,
    created_payout_ids: Vec<Uuid>,
}

impl CreatedRows {
    fn from_new_data(new_data: Option<&Value>) -> Self {
        new_data
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.created_deal_ids.is_empty() && self.created_event_ids.is_empty() && self.created_payout_ids.is_empty()
    }
}

#[derive(Clone)]
pub struct HistoryService {
    store: HistoryStore,
    deals: DealStore,
    events: EventStore,
    payouts: PayoutStore,
    history: HistoryRecorder,
}

impl HistoryService {
    pub fn new(pool: SqlitePool, history: HistoryRecorder) -> Self {
        Self {
            store: HistoryStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            payouts: PayoutStore::new(pool),
            history,
        }
    }

    pub async fn list(&self, query: &HistoryQuery) -> AppResult<Vec<ActionRecord>> {
        let filter = HistoryFilter {
            entity_type: query.entity_type.as_deref().map(str::parse).transpose()?,
            entity_id: query.entity_id.clone(),
            action_type: query.action_type.as_deref().map(str::parse).transpose()?,
            request_id: query.request_id.clone(),
            include_undone: query.include_undone.unwrap_or(false),
            limit: query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE),
            offset: query.offset.unwrap_or(0).max(0),
        };
        self.store.list(&filter).await
    }

    /// Write the captured row images of one action back and remove the rows
    /// it created. This is a point-in-time restore of a single action, not a
    /// replay: undoing an older action after newer ones overwrites them.
    pub async fn undo(&self, id: Uuid) -> AppResult<UndoResponse> {
        let action = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Action not found".to_string()))?;
        if action.is_undone {
            return Err(AppError::Conflict("Action already undone".to_string()));
        }

        let snapshot: Snapshot = match &action.previous_data {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| AppError::InvalidInput(format!("unreadable previous data: {e}")))?,
            None => Snapshot::default(),
        };
        let created = CreatedRows::from_new_data(action.new_data.as_ref());
        if snapshot.is_empty() && created.is_empty() {
            return Err(AppError::InvalidInput("No previous data to restore".to_string()));
        }

        let mut restored_rows = 0;
        for payout_id in &created.created_payout_ids {
            restored_rows += self.payouts.delete(*payout_id).await? as usize;
        }
        for deal in &snapshot.deals {
            self.deals.restore(deal).await?;
            restored_rows += 1;
        }
        for event in &snapshot.events {
            self.events.restore(event).await?;
            restored_rows += 1;
        }
        for payout in &snapshot.payouts {
            self.payouts.restore(payout).await?;
            restored_rows += 1;
        }
        for event_id in &created.created_event_ids {
            let removed = self.events.delete_if_unassigned(*event_id).await?;
            if removed == 0 {
                warn!(action_id = %id, event_id = %event_id, "imported event has moved on, leaving it");
            }
            restored_rows += removed as usize;
        }
        for deal_id in &created.created_deal_ids {
            self.events.reset_by_deal(*deal_id).await?;
            restored_rows += self.deals.delete(*deal_id).await? as usize;
        }

        let undo = NewAction::new(
            ActionType::Undo,
            action.entity_type,
            action.entity_id.clone(),
            format!("Undid: {}", action.description),
        )
        .previous(action.new_data.clone())
        .new_data(action.previous_data.clone());
        let undo = match &action.entity_name {
            Some(name) => undo.entity_name(name.clone()),
            None => undo,
        };
        let undo_action_id = undo.id;

        if self.store.mark_undone(id, undo_action_id).await? == 0 {
            return Err(AppError::Conflict("Action already undone".to_string()));
        }
        self.history.record(undo);

        info!(action_id = %id, %undo_action_id, restored_rows, "action undone");
        Ok(UndoResponse {
            success: true,
            undo_action_id,
            restored_rows,
        })
    }
}
