use std::collections::HashMap;

use residuals_common::api::{ConfirmEventsResponse, ExternalSyncSummary};
use residuals_common::error::{AppError, AppResult, ValidationFailure};
use residuals_common::split::{split_residual, RevenueInputs};
use residuals_common::types::{ActionType, AssignmentStatus, DealRecord, EntityType, EventRecord, Snapshot};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::audit::HistoryRecorder;
use crate::services::sync::SyncService;
use crate::stores::deal::DealStore;
use crate::stores::event::EventStore;
use crate::stores::history::NewAction;
use crate::stores::payout::{NewPayout, PayoutStore};

const SYNC_DISABLED: &str = "external sync partner is not configured";

#[derive(Clone)]
pub struct ConfirmationService {
    events: EventStore,
    deals: DealStore,
    payouts: PayoutStore,
    history: HistoryRecorder,
    sync: Option<SyncService>,
    block_held: bool,
}

struct ConfirmedEvent {
    created: Vec<Uuid>,
    existing: Vec<Uuid>,
    mirrored: u64,
}

impl ConfirmationService {
    pub fn new(
        pool: SqlitePool,
        history: HistoryRecorder,
        sync: Option<SyncService>,
        block_held: bool,
    ) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            payouts: PayoutStore::new(pool),
            history,
            sync,
            block_held,
        }
    }

    /// Move pending events to `confirmed` and generate their payouts.
    ///
    /// The whole batch is validated before any write. Past validation each
    /// event is written independently; a failure is reported in
    /// `failed_event_ids` and the rest carry on. The external push afterwards
    /// is best-effort.
    pub async fn confirm(&self, event_ids: &[Uuid]) -> AppResult<ConfirmEventsResponse> {
        if event_ids.is_empty() {
            return Err(AppError::validation("No event ids provided"));
        }
        let events = self.events.get_many(event_ids).await?;
        if events.is_empty() {
            return Err(AppError::NotFound("No events found".to_string()));
        }
        let mut failed_event_ids: Vec<Uuid> = event_ids
            .iter()
            .filter(|id| !events.iter().any(|e| e.id == **id))
            .copied()
            .collect();
        if !failed_event_ids.is_empty() {
            warn!(missing = failed_event_ids.len(), "confirm skipped unknown event ids");
        }

        let deals = self.check_preconditions(&events).await?;

        let mut payouts_created = 0;
        let mut payouts_updated = 0;
        let mut confirmed = Vec::new();
        let mut created_payout_ids = Vec::new();
        let mut touched = Vec::new();
        for event in &events {
            let Some(deal) = event.deal_id.and_then(|id| deals.get(&id)) else {
                failed_event_ids.push(event.id);
                continue;
            };
            match self.confirm_one(event, deal).await {
                Ok(done) => {
                    payouts_created += done.created.len();
                    payouts_updated += done.mirrored;
                    touched.extend(done.existing);
                    touched.extend(done.created.iter().copied());
                    created_payout_ids.extend(done.created);
                    confirmed.push(event.id);
                }
                Err(err) => {
                    warn!(event_id = %event.id, mid = %event.mid, error = %err, "event confirmation failed");
                    failed_event_ids.push(event.id);
                }
            }
        }

        let external_sync_summary = match &self.sync {
            Some(sync) => sync.push_payouts(&touched).await,
            None => ExternalSyncSummary {
                skipped_reason: Some(SYNC_DISABLED.to_string()),
                ..ExternalSyncSummary::default()
            },
        };
        if !external_sync_summary.errors.is_empty() {
            warn!(errors = ?external_sync_summary.errors, "confirm-time sync reported errors");
        }

        info!(
            confirmed = confirmed.len(),
            payouts_created,
            payouts_updated,
            failed = failed_event_ids.len(),
            synced = external_sync_summary.synced,
            "events confirmed"
        );

        let request_id = Uuid::new_v4().to_string();
        let previous: Vec<EventRecord> = events.into_iter().filter(|e| confirmed.contains(&e.id)).collect();
        self.history.record(
            NewAction::new(
                ActionType::BulkUpdate,
                EntityType::Assignment,
                request_id.clone(),
                format!("Confirmed {} event(s), created {payouts_created} payout(s)", confirmed.len()),
            )
            .request(&request_id)
            .previous(
                Snapshot {
                    events: previous,
                    ..Snapshot::default()
                }
                .to_value(),
            )
            .new_data(Some(json!({
                "confirmed_event_ids": confirmed,
                "created_payout_ids": created_payout_ids,
            }))),
        );

        Ok(ConfirmEventsResponse {
            confirmed_count: confirmed.len(),
            payouts_created,
            payouts_updated,
            failed_event_ids,
            external_sync_summary,
        })
    }

    /// Every event needs a deal and the deal needs participants. Offending
    /// merchant ids are listed in the error, and nothing has been written.
    async fn check_preconditions(&self, events: &[EventRecord]) -> AppResult<HashMap<Uuid, DealRecord>> {
        let mut deals: HashMap<Uuid, DealRecord> = HashMap::new();
        let mut unassigned = Vec::new();
        let mut missing_participants = Vec::new();
        let mut held = Vec::new();

        for event in events {
            if self.block_held && event.is_held {
                push_unique(&mut held, &event.mid);
            }
            let Some(deal_id) = event.deal_id else {
                push_unique(&mut unassigned, &event.mid);
                continue;
            };
            if !deals.contains_key(&deal_id) {
                match self.deals.get(deal_id).await? {
                    Some(deal) => {
                        deals.insert(deal_id, deal);
                    }
                    None => {
                        push_unique(&mut unassigned, &event.mid);
                        continue;
                    }
                }
            }
            if deals.get(&deal_id).is_some_and(|d| d.participants.is_empty()) {
                push_unique(&mut missing_participants, &event.mid);
            }
        }

        let message = if !unassigned.is_empty() {
            format!(
                "Cannot confirm events without deals assigned. Please assign partners first for MIDs: {}",
                unassigned.join(", ")
            )
        } else if !missing_participants.is_empty() {
            format!(
                "Cannot confirm events without participants assigned. Please assign participants first for MIDs: {}",
                missing_participants.join(", ")
            )
        } else if !held.is_empty() {
            format!("Cannot confirm held events. Release the hold first for MIDs: {}", held.join(", "))
        } else {
            return Ok(deals);
        };

        Err(AppError::Validation(ValidationFailure {
            message,
            unassigned_mids: unassigned,
            missing_participant_mids: missing_participants,
            held_mids: held,
        }))
    }

    async fn confirm_one(&self, event: &EventRecord, deal: &DealRecord) -> AppResult<ConfirmedEvent> {
        let existing: Vec<Uuid> = self
            .payouts
            .list_for_events(&[event.id])
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let mut fresh = Vec::new();
        if existing.is_empty() {
            let inputs = RevenueInputs {
                fees: Some(event.fees),
                adjustments: Some(event.adjustments),
                chargebacks: Some(event.chargebacks),
            };
            let net_residual = inputs.net_residual();
            for share in split_residual(inputs, &deal.participants) {
                let participant = share.participant;
                fresh.push(NewPayout {
                    csv_data_id: Some(event.id),
                    deal_id: Some(deal.deal_id.clone()),
                    mid: event.mid.clone(),
                    merchant_name: event.merchant_name.clone(),
                    payout_month: event.payout_month.clone(),
                    payout_type: event.payout_type.clone(),
                    volume: event.volume,
                    fees: event.fees,
                    adjustments: event.adjustments,
                    chargebacks: event.chargebacks,
                    net_residual,
                    partner_airtable_id: participant.partner_airtable_id,
                    partner_name: Some(participant.partner_name).filter(|n| !n.is_empty()),
                    partner_role: participant.partner_role,
                    partner_split_pct: participant.split_pct,
                    partner_payout_amount: share.amount,
                    assignment_status: AssignmentStatus::Confirmed,
                });
            }
        }

        // Status flip and payout rows commit together, so a failed event is
        // left pending with no payouts and a retry regenerates all of them.
        let (created, mirrored) = self
            .payouts
            .settle_event(event.id, AssignmentStatus::Confirmed, fresh)
            .await?;

        Ok(ConfirmedEvent {
            created,
            existing,
            mirrored,
        })
    }
}

fn push_unique(list: &mut Vec<String>, mid: &str) {
    if !list.iter().any(|m| m == mid) {
        list.push(mid.to_string());
    }
}

#[cfg(test)]
mod tests {
    use residuals_common::api::AssignParticipantsRequest;
    use residuals_common::error::AppError;
    use residuals_common::participant::Participant;
    use residuals_common::types::AssignmentStatus;
    use rust_decimal::Decimal;
    use sqlx::SqlitePool;
    use uuid::Uuid;

    use super::ConfirmationService;
    use crate::db::memory_pool;
    use crate::services::audit::HistoryRecorder;
    use crate::services::deals::DealService;
    use crate::stores::deal::DealStore;
    use crate::stores::event::{EventStore, NewEvent};
    use crate::stores::history::HistoryStore;
    use crate::stores::payout::PayoutStore;

    async fn event(pool: &SqlitePool, hash: &str, mid: &str, fees: i64) -> Uuid {
        EventStore::new(pool.clone())
            .insert_if_new(NewEvent {
                row_hash: hash.to_string(),
                batch_id: "b1".to_string(),
                mid: mid.to_string(),
                merchant_name: Some(format!("Merchant {mid}")),
                volume: Decimal::new(50_000, 0),
                fees: Decimal::new(fees, 0),
                adjustments: Decimal::ZERO,
                chargebacks: Decimal::ZERO,
                date: None,
                payout_month: Some("2024-07".to_string()),
                payout_type: "residual".to_string(),
                raw_data: None,
            })
            .await
            .expect("insert")
            .expect("new")
    }

    fn participant(id: &str, pct: i64) -> Participant {
        Participant {
            partner_airtable_id: id.to_string(),
            partner_name: id.to_uppercase(),
            partner_role: "Partner".to_string(),
            split_pct: Decimal::new(pct, 0),
        }
    }

    async fn setup() -> (SqlitePool, HistoryRecorder) {
        let pool = memory_pool().await.expect("pool");
        let history = HistoryRecorder::start(HistoryStore::new(pool.clone()));
        (pool, history)
    }

    #[tokio::test]
    async fn confirm_generates_one_payout_per_participant() {
        let (pool, history) = setup().await;
        let event_id = event(&pool, "h1", "1001", 1000).await;
        DealService::new(pool.clone(), history.clone())
            .assign(AssignParticipantsRequest {
                mid: "1001".to_string(),
                payout_type: None,
                participants: vec![participant("a", 35), participant("b", 65)],
                event_ids: vec![event_id],
            })
            .await
            .expect("assign");

        let svc = ConfirmationService::new(pool.clone(), history, None, false);
        let out = svc.confirm(&[event_id]).await.expect("confirm");

        assert_eq!(out.confirmed_count, 1);
        assert_eq!(out.payouts_created, 2);
        assert!(out.external_sync_summary.skipped_reason.is_some());

        let payouts = PayoutStore::new(pool.clone()).list_for_events(&[event_id]).await.expect("payouts");
        let amounts: Vec<Decimal> = payouts.iter().map(|p| p.partner_payout_amount).collect();
        assert!(amounts.contains(&Decimal::new(350, 0)));
        assert!(amounts.contains(&Decimal::new(650, 0)));

        let again = svc.confirm(&[event_id]).await.expect("reconfirm");
        assert_eq!(again.payouts_created, 0);
        assert_eq!(again.payouts_updated, 2);
    }

    #[tokio::test]
    async fn failed_payout_insert_leaves_event_pending_and_retry_completes() {
        let (pool, history) = setup().await;
        let event_id = event(&pool, "h1", "1001", 1000).await;
        DealService::new(pool.clone(), history.clone())
            .assign(AssignParticipantsRequest {
                mid: "1001".to_string(),
                payout_type: None,
                participants: vec![participant("a", 40), participant("b", 60)],
                event_ids: vec![event_id],
            })
            .await
            .expect("assign");
        sqlx::query(
            "CREATE TRIGGER reject_partner_b BEFORE INSERT ON payouts \
             WHEN NEW.partner_airtable_id = 'b' BEGIN SELECT RAISE(ABORT, 'partner b refused'); END",
        )
        .execute(&pool)
        .await
        .expect("trigger");

        let svc = ConfirmationService::new(pool.clone(), history, None, false);
        let first = svc.confirm(&[event_id]).await.expect("confirm");
        assert_eq!(first.confirmed_count, 0);
        assert_eq!(first.failed_event_ids, vec![event_id]);

        let payouts = PayoutStore::new(pool.clone());
        assert!(payouts.list_for_events(&[event_id]).await.expect("payouts").is_empty());
        let pending = EventStore::new(pool.clone()).get(event_id).await.expect("get").expect("event");
        assert_eq!(pending.assignment_status, AssignmentStatus::Pending);

        sqlx::query("DROP TRIGGER reject_partner_b").execute(&pool).await.expect("drop");
        let retry = svc.confirm(&[event_id]).await.expect("retry");
        assert_eq!(retry.confirmed_count, 1);
        assert_eq!(retry.payouts_created, 2);
        let rows = payouts.list_for_events(&[event_id]).await.expect("payouts");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|p| p.assignment_status == AssignmentStatus::Confirmed));
    }

    #[tokio::test]
    async fn unassigned_event_fails_the_whole_batch() {
        let (pool, history) = setup().await;
        let assigned = event(&pool, "h1", "1001", 1000).await;
        let loose = event(&pool, "h2", "2002", 500).await;
        DealService::new(pool.clone(), history.clone())
            .assign(AssignParticipantsRequest {
                mid: "1001".to_string(),
                payout_type: None,
                participants: vec![participant("a", 100)],
                event_ids: vec![assigned],
            })
            .await
            .expect("assign");

        let err = ConfirmationService::new(pool.clone(), history, None, false)
            .confirm(&[assigned, loose])
            .await
            .expect_err("must fail");

        match err {
            AppError::Validation(failure) => {
                assert_eq!(failure.unassigned_mids, vec!["2002".to_string()]);
                assert!(failure.message.contains("2002"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        let payouts = PayoutStore::new(pool.clone()).list_for_events(&[assigned]).await.expect("payouts");
        assert!(payouts.is_empty());
        let untouched = EventStore::new(pool).get(assigned).await.expect("get").expect("event");
        assert_eq!(untouched.assignment_status, AssignmentStatus::Pending);
    }

    #[tokio::test]
    async fn empty_participant_list_names_the_merchant() {
        let (pool, history) = setup().await;
        let event_id = event(&pool, "h1", "3003", 100).await;
        let deal = DealService::new(pool.clone(), history.clone())
            .assign(AssignParticipantsRequest {
                mid: "3003".to_string(),
                payout_type: None,
                participants: vec![participant("a", 100)],
                event_ids: vec![event_id],
            })
            .await
            .expect("assign");
        DealStore::new(pool.clone())
            .set_participants(deal.deal_id, &[])
            .await
            .expect("clear participants");

        let err = ConfirmationService::new(pool.clone(), history, None, false)
            .confirm(&[event_id])
            .await
            .expect_err("must fail");
        match err {
            AppError::Validation(failure) => assert_eq!(failure.missing_participant_mids, vec!["3003".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(PayoutStore::new(pool).list_for_events(&[event_id]).await.expect("payouts").is_empty());
    }

    #[tokio::test]
    async fn held_events_block_confirm_only_when_enabled() {
        let (pool, history) = setup().await;
        let event_id = event(&pool, "h1", "4004", 100).await;
        DealService::new(pool.clone(), history.clone())
            .assign(AssignParticipantsRequest {
                mid: "4004".to_string(),
                payout_type: None,
                participants: vec![participant("a", 100)],
                event_ids: vec![event_id],
            })
            .await
            .expect("assign");
        EventStore::new(pool.clone())
            .set_hold(&[event_id], true, Some("disputed"))
            .await
            .expect("hold");

        let strict = ConfirmationService::new(pool.clone(), history.clone(), None, true);
        let err = strict.confirm(&[event_id]).await.expect_err("held");
        assert!(matches!(err, AppError::Validation(ref f) if f.held_mids == vec!["4004".to_string()]));

        let lenient = ConfirmationService::new(pool, history, None, false);
        assert_eq!(lenient.confirm(&[event_id]).await.expect("confirm").confirmed_count, 1);
    }
}
