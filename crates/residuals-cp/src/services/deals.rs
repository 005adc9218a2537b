use std::collections::HashSet;

use residuals_common::api::{
    AssignParticipantsRequest, AssignParticipantsResponse, DealListResponse, DealQuery, RejectDealResponse,
    UpdateDealRequest,
};
use residuals_common::error::{AppError, AppResult};
use residuals_common::mid::normalize_mid;
use residuals_common::split::validate_split_total;
use residuals_common::types::{ActionType, DealRecord, EntityType, Snapshot, DEFAULT_PAYOUT_TYPE};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::audit::HistoryRecorder;
use crate::services::cascade::{Cascade, CascadeStep};
use crate::stores::deal::{DealStore, NewDeal};
use crate::stores::event::{AssignmentUpdate, EventStore};
use crate::stores::history::NewAction;
use crate::stores::payout::PayoutStore;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

/// Whether a cascading deal removal came from the review queue or from deal
/// management. Only the audit description differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealRemoval {
    Reject,
    Delete,
}

#[derive(Clone)]
pub struct DealService {
    events: EventStore,
    deals: DealStore,
    payouts: PayoutStore,
    cascade: Cascade,
    history: HistoryRecorder,
}

impl DealService {
    pub fn new(pool: SqlitePool, history: HistoryRecorder) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            payouts: PayoutStore::new(pool.clone()),
            cascade: Cascade::new(pool),
            history,
        }
    }

    /// Attach a participant split to a merchant and move the given events to
    /// `pending`. The deal for a merchant is reused whatever its payout type.
    pub async fn assign(&self, request: AssignParticipantsRequest) -> AppResult<AssignParticipantsResponse> {
        let mid = normalize_mid(&request.mid);
        if mid.is_empty() {
            return Err(AppError::validation("Merchant id is required"));
        }
        let Some(lead) = request.participants.first() else {
            return Err(AppError::validation("At least one participant is required"));
        };
        if request.event_ids.is_empty() {
            return Err(AppError::validation("At least one event id is required"));
        }
        let total = validate_split_total(&request.participants)?;
        let payout_type = request
            .payout_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_PAYOUT_TYPE)
            .to_string();

        let prior_events = self.events.get_many(&request.event_ids).await?;
        if prior_events.len() != request.event_ids.len() {
            let found: HashSet<Uuid> = prior_events.iter().map(|e| e.id).collect();
            let missing: Vec<String> = request
                .event_ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(ToString::to_string)
                .collect();
            return Err(AppError::NotFound(format!("events {}", missing.join(", "))));
        }

        let agent_name = Some(lead.partner_name.clone()).filter(|n| !n.is_empty());
        let existing = self.deals.find_by_mid(&mid).await?;
        let (deal, created) = match &existing {
            Some(deal) => {
                if deal.payout_type != payout_type {
                    warn!(
                        deal_id = %deal.id,
                        %mid,
                        previous = %deal.payout_type,
                        requested = %payout_type,
                        "reassignment changes payout type of the merchant's only deal"
                    );
                }
                self.deals
                    .update_assignment(deal.id, &request.participants, &payout_type, agent_name.as_deref())
                    .await?;
                let updated = self
                    .deals
                    .get(deal.id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("deal {}", deal.id)))?;
                (updated, false)
            }
            None => {
                let deal = self
                    .deals
                    .create(NewDeal {
                        deal_id: format!("deal_{}", Uuid::new_v4()),
                        mid: mid.clone(),
                        participants: request.participants.clone(),
                        payout_type: payout_type.clone(),
                        assigned_agent_name: agent_name.clone(),
                    })
                    .await?;
                (deal, true)
            }
        };

        let events_updated = self
            .events
            .assign(
                &request.event_ids,
                &AssignmentUpdate {
                    deal_id: deal.id,
                    assigned_agent_id: Some(lead.partner_airtable_id.clone()),
                    assigned_agent_name: agent_name,
                    payout_type: payout_type.clone(),
                },
            )
            .await?;

        info!(
            deal_id = %deal.id,
            %mid,
            created,
            events = events_updated,
            total_split = %total,
            "participants assigned"
        );

        let previous = Snapshot {
            deals: existing.iter().cloned().collect(),
            events: prior_events,
            payouts: Vec::new(),
        };
        // Undo deletes any deal this call created and restores the rest.
        let new_data = if created {
            json!({ "deal": deal, "event_ids": request.event_ids, "created_deal_ids": [deal.id] })
        } else {
            json!({
                "deal": deal,
                "event_ids": request.event_ids,
                "previous_payout_type": existing.as_ref().map(|d| d.payout_type.clone()),
            })
        };
        let action = NewAction::new(
            if created { ActionType::Create } else { ActionType::Update },
            EntityType::Assignment,
            deal.id.to_string(),
            format!(
                "Assigned {events_updated} event(s) for MID {mid} to {} participant(s) ({}%)",
                deal.participants.len(),
                total.normalize()
            ),
        )
        .entity_name(mid.clone())
        .previous(previous.to_value())
        .new_data(Some(new_data));
        self.history.record(action);

        Ok(AssignParticipantsResponse {
            deal_id: deal.id,
            deal_token: deal.deal_id,
            created,
            events_updated,
        })
    }

    pub async fn reject(&self, id: Uuid) -> AppResult<RejectDealResponse> {
        self.remove(id, DealRemoval::Reject).await
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<RejectDealResponse> {
        self.remove(id, DealRemoval::Delete).await
    }

    /// Delete the deal's payouts, return its events to `unassigned`, then drop
    /// the deal. The prior rows are captured for undo before anything runs.
    pub async fn remove(&self, id: Uuid, kind: DealRemoval) -> AppResult<RejectDealResponse> {
        let deal = self
            .deals
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Deal not found".to_string()))?;
        let linked = self.events.list_by_deal(id).await?;
        let event_ids: Vec<Uuid> = linked.iter().map(|e| e.id).collect();

        let mut payouts = self.payouts.list_for_events(&event_ids).await?;
        let seen: HashSet<Uuid> = payouts.iter().map(|p| p.id).collect();
        payouts.extend(
            self.payouts
                .list_for_deal_token(&deal.deal_id)
                .await?
                .into_iter()
                .filter(|p| !seen.contains(&p.id)),
        );

        let report = self
            .cascade
            .run(vec![
                CascadeStep::DeletePayoutsForEvents(event_ids.clone()),
                CascadeStep::DeletePayoutsForDealToken(deal.deal_id.clone()),
                CascadeStep::ResetEvents(event_ids),
                CascadeStep::DeleteDeal(id),
            ])
            .await;

        let verb = match kind {
            DealRemoval::Reject => "Rejected",
            DealRemoval::Delete => "Deleted",
        };
        let description = format!(
            "{verb} deal {} for MID {} ({} event(s) reset, {} payout(s) removed)",
            deal.deal_id,
            deal.mid,
            linked.len(),
            payouts.len()
        );
        info!(deal_id = %id, mid = %deal.mid, failed = report.failed(), "{description}");
        self.history.record(
            NewAction::new(ActionType::Delete, EntityType::Deal, id.to_string(), description)
                .entity_name(deal.mid.clone())
                .previous(
                    Snapshot {
                        deals: vec![deal.clone()],
                        events: linked,
                        payouts,
                    }
                    .to_value(),
                )
                .new_data(serde_json::to_value(&report).ok()),
        );

        if report.failed() {
            let errors: Vec<String> = report
                .steps
                .iter()
                .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {e}", s.step)))
                .collect();
            return Err(AppError::Persistence(format!(
                "deal {} removal incomplete: {}",
                deal.deal_id,
                errors.join("; ")
            )));
        }

        Ok(RejectDealResponse {
            success: true,
            events_reset: report.affected("reset_events"),
            payouts_deleted: report.affected("delete_payouts_for_events")
                + report.affected("delete_payouts_for_deal_token"),
            cascade: report,
        })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<DealRecord> {
        self.deals
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Deal not found".to_string()))
    }

    pub async fn by_mid(&self, mid: &str) -> AppResult<DealRecord> {
        let mid = normalize_mid(mid);
        self.deals
            .find_by_mid(&mid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No deal for MID {mid}")))
    }

    pub async fn for_event(&self, event_id: Uuid) -> AppResult<DealRecord> {
        let event = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Event not found".to_string()))?;
        let deal_id = event
            .deal_id
            .ok_or_else(|| AppError::NotFound(format!("Event {event_id} has no deal")))?;
        self.get(deal_id).await
    }

    pub async fn list(&self, query: &DealQuery) -> AppResult<DealListResponse> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let offset = query.offset.unwrap_or(0).max(0);
        let (deals, total) = self.deals.list(query.search.as_deref(), limit, offset).await?;
        Ok(DealListResponse { deals, total })
    }

    /// Direct participant edit. Existing payouts keep their amounts.
    pub async fn update(&self, id: Uuid, request: UpdateDealRequest) -> AppResult<DealRecord> {
        let before = self.get(id).await?;
        validate_split_total(&request.participants)?;

        let payout_type = request
            .payout_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&before.payout_type)
            .to_string();
        let agent_name = request
            .participants
            .first()
            .map(|p| p.partner_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| before.assigned_agent_name.clone());

        self.deals
            .update_assignment(id, &request.participants, &payout_type, agent_name.as_deref())
            .await?;
        if let Some(available) = request.available_to_purchase {
            self.deals.set_available_to_purchase(id, available).await?;
        }
        let after = self.get(id).await?;

        info!(deal_id = %id, participants = after.participants.len(), "deal participants updated");
        self.history.record(
            NewAction::new(
                ActionType::Update,
                EntityType::Deal,
                id.to_string(),
                format!("Updated participants for deal {}", after.deal_id),
            )
            .entity_name(after.mid.clone())
            .previous(
                Snapshot {
                    deals: vec![before],
                    ..Snapshot::default()
                }
                .to_value(),
            )
            .new_data(serde_json::to_value(&after).ok()),
        );

        Ok(after)
    }
}
