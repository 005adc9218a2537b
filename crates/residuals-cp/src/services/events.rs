use std::collections::HashSet;

use residuals_common::api::{
    BatchSummary, BulkPayoutMonthRequest, CascadeReport, DeleteEventsResponse, EventListResponse, EventQuery,
    EventStats, HoldEventsRequest, ImportEventsRequest, ImportEventsResponse, RejectDealResponse, RowError,
};
use residuals_common::columns::{is_payout_month, resolve_row};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::{
    ActionType, AssignmentStatus, EntityType, EventRecord, Snapshot, DEFAULT_PAYOUT_TYPE,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::audit::HistoryRecorder;
use crate::services::cascade::{Cascade, CascadeStep};
use crate::services::deals::DealService;
use crate::stores::deal::DealStore;
use crate::stores::event::{EventFilter, EventStore, NewEvent};
use crate::stores::history::NewAction;
use crate::stores::payout::PayoutStore;

const DEFAULT_PAGE: i64 = 100;
const MAX_PAGE: i64 = 1000;

#[derive(Clone)]
pub struct EventService {
    events: EventStore,
    deals: DealStore,
    payouts: PayoutStore,
    deal_service: DealService,
    cascade: Cascade,
    history: HistoryRecorder,
}

impl EventService {
    pub fn new(pool: SqlitePool, history: HistoryRecorder) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            payouts: PayoutStore::new(pool.clone()),
            deal_service: DealService::new(pool.clone(), history.clone()),
            cascade: Cascade::new(pool),
            history,
        }
    }

    /// Store uploaded rows as unassigned events. Rows already seen (same
    /// content hash) are counted as duplicates, and rows without a merchant
    /// id are reported without failing the upload.
    pub async fn import(&self, request: ImportEventsRequest) -> AppResult<ImportEventsResponse> {
        if request.rows.is_empty() {
            return Err(AppError::validation("No rows to import"));
        }
        if let Some(month) = request.payout_month.as_deref() {
            if !is_payout_month(month) {
                return Err(AppError::InvalidInput(format!("payout_month must be YYYY-MM, got {month}")));
            }
        }
        let payout_type = request
            .payout_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_PAYOUT_TYPE)
            .to_string();

        let batch_id = Uuid::new_v4().to_string();
        let mut created = Vec::new();
        let mut duplicates = 0;
        let mut errors = Vec::new();

        for (index, row) in request.rows.iter().enumerate() {
            let row_no = index + 1;
            let resolved = match resolve_row(row, request.payout_month.as_deref()) {
                Ok(resolved) => resolved,
                Err(message) => {
                    errors.push(RowError { row: row_no, message });
                    continue;
                }
            };
            let inserted = self
                .events
                .insert_if_new(NewEvent {
                    row_hash: resolved.row_hash,
                    batch_id: batch_id.clone(),
                    mid: resolved.mid,
                    merchant_name: resolved.merchant_name,
                    volume: resolved.volume,
                    fees: resolved.fees,
                    adjustments: resolved.adjustments,
                    chargebacks: resolved.chargebacks,
                    date: resolved.date,
                    payout_month: resolved.payout_month,
                    payout_type: payout_type.clone(),
                    raw_data: Some(Value::Object(row.clone())),
                })
                .await;
            match inserted {
                Ok(Some(id)) => created.push(id),
                Ok(None) => duplicates += 1,
                Err(err) => {
                    warn!(row = row_no, error = %err, "event row insert failed");
                    errors.push(RowError {
                        row: row_no,
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            %batch_id,
            imported = created.len(),
            duplicates,
            errors = errors.len(),
            "event import finished"
        );
        self.history.record(
            NewAction::new(
                ActionType::Import,
                EntityType::Event,
                batch_id.clone(),
                format!("Imported {} row(s), skipped {duplicates} duplicate(s)", created.len()),
            )
            .batch(&batch_id)
            .new_data(Some(json!({ "created_event_ids": created }))),
        );

        Ok(ImportEventsResponse {
            batch_id,
            imported: created.len(),
            duplicates,
            errors,
        })
    }

    pub async fn list(&self, query: &EventQuery) -> AppResult<EventListResponse> {
        let statuses = match query.status.as_deref().map(str::trim) {
            None | Some("") | Some("all") => Vec::new(),
            Some("pending") | Some("pending_confirmation") => {
                vec![AssignmentStatus::Pending, AssignmentStatus::PendingConfirmation]
            }
            Some(other) => vec![other.parse()?],
        };
        let filter = EventFilter {
            statuses,
            batch_id: query.batch_id.clone(),
            payout_month: query.payout_month.clone(),
            search: query.search.clone(),
            limit: query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE),
            offset: query.offset.unwrap_or(0).max(0),
        };
        let (events, total) = self.events.list(&filter).await?;
        Ok(EventListResponse { events, total })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<EventRecord> {
        self.events
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Event not found".to_string()))
    }

    pub async fn stats(&self) -> AppResult<EventStats> {
        self.events.stats().await
    }

    pub async fn batches(&self) -> AppResult<Vec<BatchSummary>> {
        self.events.batches().await
    }

    pub async fn hold(&self, request: &HoldEventsRequest) -> AppResult<u64> {
        self.set_hold(&request.event_ids, true, request.reason.as_deref()).await
    }

    pub async fn release(&self, event_ids: &[Uuid]) -> AppResult<u64> {
        self.set_hold(event_ids, false, None).await
    }

    async fn set_hold(&self, event_ids: &[Uuid], held: bool, reason: Option<&str>) -> AppResult<u64> {
        let before = self.events.get_many(event_ids).await?;
        let updated = self.events.set_hold(event_ids, held, reason).await?;
        let verb = if held { "Held" } else { "Released" };
        info!(updated, held, "event hold changed");
        self.history.record(
            NewAction::new(
                ActionType::BulkUpdate,
                EntityType::Event,
                join_ids(event_ids),
                format!("{verb} {updated} event(s)"),
            )
            .previous(snapshot_of_events(before).to_value())
            .new_data(Some(json!({ "is_held": held, "hold_reason": reason }))),
        );
        Ok(updated)
    }

    pub async fn set_payout_month(&self, request: &BulkPayoutMonthRequest) -> AppResult<u64> {
        if !is_payout_month(&request.payout_month) {
            return Err(AppError::InvalidInput(format!(
                "payout_month must be YYYY-MM, got {}",
                request.payout_month
            )));
        }
        let before = self.events.get_many(&request.event_ids).await?;
        let updated = self
            .events
            .set_payout_month(&request.event_ids, &request.payout_month)
            .await?;
        info!(updated, payout_month = %request.payout_month, "event payout month changed");
        self.history.record(
            NewAction::new(
                ActionType::BulkUpdate,
                EntityType::Event,
                join_ids(&request.event_ids),
                format!("Moved {updated} event(s) to {}", request.payout_month),
            )
            .previous(snapshot_of_events(before).to_value())
            .new_data(Some(json!({ "payout_month": request.payout_month }))),
        );
        Ok(updated)
    }

    /// Back to `unassigned` without touching payouts or the deal.
    pub async fn reset(&self, id: Uuid) -> AppResult<EventRecord> {
        let before = self.get(id).await?;
        self.events.reset(id).await?;
        let after = self.get(id).await?;
        info!(event_id = %id, mid = %after.mid, "event reset");
        self.history.record(
            NewAction::new(
                ActionType::Update,
                EntityType::Event,
                id.to_string(),
                format!("Reset event for MID {} to unassigned", after.mid),
            )
            .entity_name(after.mid.clone())
            .previous(snapshot_of_events(vec![before]).to_value()),
        );
        Ok(after)
    }

    /// Reject through the event's deal when it has one, otherwise reset.
    pub async fn reject(&self, id: Uuid) -> AppResult<RejectDealResponse> {
        let event = self.get(id).await?;
        let deal = match event.deal_id {
            Some(deal_id) => self.deals.get(deal_id).await?,
            None => None,
        };
        match deal {
            Some(deal) => self.deal_service.reject(deal.id).await,
            None => {
                self.reset(id).await?;
                Ok(RejectDealResponse {
                    success: true,
                    events_reset: 1,
                    payouts_deleted: 0,
                    cascade: CascadeReport::default(),
                })
            }
        }
    }

    /// Delete events that are still unassigned. Anything else is skipped and
    /// reported back.
    pub async fn delete_unassigned(&self, event_ids: &[Uuid]) -> AppResult<DeleteEventsResponse> {
        let mut deleted_rows = Vec::new();
        let mut skipped = Vec::new();
        for id in event_ids {
            let Some(event) = self.events.get(*id).await? else {
                skipped.push(*id);
                continue;
            };
            if event.assignment_status != AssignmentStatus::Unassigned {
                skipped.push(*id);
                continue;
            }
            if self.events.delete_if_unassigned(*id).await? == 1 {
                deleted_rows.push(event);
            } else {
                skipped.push(*id);
            }
        }

        let deleted = deleted_rows.len() as u64;
        info!(deleted, skipped = skipped.len(), "unassigned events deleted");
        if deleted > 0 {
            self.history.record(
                NewAction::new(
                    ActionType::BulkDelete,
                    EntityType::Event,
                    join_ids(&deleted_rows.iter().map(|e| e.id).collect::<Vec<_>>()),
                    format!("Deleted {deleted} unassigned event(s)"),
                )
                .previous(snapshot_of_events(deleted_rows).to_value()),
            );
        }
        Ok(DeleteEventsResponse { deleted, skipped })
    }

    /// Delete an event in any state along with its deal and every payout
    /// hanging off that deal. Other events on the same deal fall back to
    /// `unassigned`.
    pub async fn force_delete(&self, id: Uuid) -> AppResult<CascadeReport> {
        let event = self.get(id).await?;
        let deal = match event.deal_id {
            Some(deal_id) => self.deals.get(deal_id).await?,
            None => None,
        };
        let mut events = vec![event.clone()];
        let mut steps = Vec::new();
        let payouts = match &deal {
            Some(deal) => {
                let siblings: Vec<EventRecord> =
                    self.events.list_by_deal(deal.id).await?.into_iter().filter(|e| e.id != id).collect();
                let sibling_ids: Vec<Uuid> = siblings.iter().map(|e| e.id).collect();
                let mut linked_ids = vec![id];
                linked_ids.extend(sibling_ids.iter().copied());
                events.extend(siblings);

                let mut payouts = self.payouts.list_for_events(&linked_ids).await?;
                let seen: HashSet<Uuid> = payouts.iter().map(|p| p.id).collect();
                payouts.extend(
                    self.payouts
                        .list_for_deal_token(&deal.deal_id)
                        .await?
                        .into_iter()
                        .filter(|p| !seen.contains(&p.id)),
                );

                steps.push(CascadeStep::DeletePayoutsForEvents(linked_ids));
                steps.push(CascadeStep::DeletePayoutsForDealToken(deal.deal_id.clone()));
                steps.push(CascadeStep::ResetEvents(sibling_ids));
                steps.push(CascadeStep::DeleteDeal(deal.id));
                payouts
            }
            None => {
                steps.push(CascadeStep::DeletePayoutsForEvents(vec![id]));
                self.payouts.list_for_events(&[id]).await?
            }
        };
        steps.push(CascadeStep::DeleteEvent(id));

        let report = self.cascade.run(steps).await;
        warn!(event_id = %id, mid = %event.mid, payouts = payouts.len(), failed = report.failed(), "event force deleted");
        self.history.record(
            NewAction::new(
                ActionType::Delete,
                EntityType::Event,
                id.to_string(),
                format!("Force deleted event for MID {} with {} payout(s)", event.mid, payouts.len()),
            )
            .entity_name(event.mid.clone())
            .previous(
                Snapshot {
                    deals: deal.into_iter().collect(),
                    events,
                    payouts,
                }
                .to_value(),
            )
            .new_data(serde_json::to_value(&report).ok()),
        );

        if report.failed() {
            return Err(AppError::Persistence(format!("force delete of event {id} incomplete")));
        }
        Ok(report)
    }
}

fn snapshot_of_events(events: Vec<EventRecord>) -> Snapshot {
    Snapshot {
        events,
        ..Snapshot::default()
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}
