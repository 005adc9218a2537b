use std::fmt;
use std::str::FromStr;

use residuals_common::api::RepairResponse;
use residuals_common::error::{AppError, AppResult};
use residuals_common::mid::prefixed_sibling;
use residuals_common::types::{ActionType, EntityType, Snapshot};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::services::audit::HistoryRecorder;
use crate::services::cascade::{Cascade, CascadeStep};
use crate::stores::deal::DealStore;
use crate::stores::event::EventStore;
use crate::stores::history::NewAction;
use crate::stores::payout::PayoutStore;
use crate::stores::repair::RepairStore;

/// Version tag recorded with every committed repair step.
pub const REPAIR_VERSION: &str = "00-prefix-mid/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    Count,
    UpdatePayouts,
    UpdateDeals,
    DeletePayouts,
    DeleteDeals,
}

impl RepairStep {
    pub const ALL: [RepairStep; 5] = [
        Self::Count,
        Self::UpdatePayouts,
        Self::UpdateDeals,
        Self::DeletePayouts,
        Self::DeleteDeals,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::UpdatePayouts => "update_payouts",
            Self::UpdateDeals => "update_deals",
            Self::DeletePayouts => "delete_payouts",
            Self::DeleteDeals => "delete_deals",
        }
    }
}

impl fmt::Display for RepairStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepairStep {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == raw.trim())
            .ok_or_else(|| AppError::InvalidInput(format!("unknown repair step: {raw}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    DryRun,
    Commit,
}

impl RepairMode {
    pub fn from_commit(commit: bool) -> Self {
        if commit {
            Self::Commit
        } else {
            Self::DryRun
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Commit => "commit",
        }
    }
}

struct StepOutcome {
    message: String,
    affected: u64,
    payouts: Option<u64>,
    deals: Option<u64>,
    snapshot: Snapshot,
}

impl StepOutcome {
    fn affected(message: String, affected: u64) -> Self {
        Self {
            message,
            affected,
            payouts: None,
            deals: None,
            snapshot: Snapshot::default(),
        }
    }
}

/// Repairs merchants that were imported twice, once with a `00` prefix. Each
/// step reads the current table state, so steps can run in any order and any
/// number of times.
#[derive(Clone)]
pub struct RepairService {
    repair: RepairStore,
    payouts: PayoutStore,
    deals: DealStore,
    events: EventStore,
    cascade: Cascade,
    history: HistoryRecorder,
}

impl RepairService {
    pub fn new(pool: SqlitePool, history: HistoryRecorder) -> Self {
        Self {
            repair: RepairStore::new(pool.clone()),
            payouts: PayoutStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            cascade: Cascade::new(pool),
            history,
        }
    }

    pub async fn run(&self, step: RepairStep, mode: RepairMode) -> AppResult<RepairResponse> {
        let outcome = match step {
            RepairStep::Count => self.count().await?,
            RepairStep::UpdatePayouts => self.update_payouts(mode).await?,
            RepairStep::UpdateDeals => self.update_deals(mode).await?,
            RepairStep::DeletePayouts => self.delete_payouts(mode).await?,
            RepairStep::DeleteDeals => self.delete_deals(mode).await?,
        };
        info!(
            version = REPAIR_VERSION,
            step = step.as_str(),
            mode = mode.as_str(),
            affected = outcome.affected,
            "{}",
            outcome.message
        );

        if mode == RepairMode::Commit && step != RepairStep::Count {
            let run_id = self
                .repair
                .record_run(REPAIR_VERSION, step.as_str(), outcome.affected)
                .await?;
            self.history.record(
                NewAction::new(
                    ActionType::BulkUpdate,
                    EntityType::Maintenance,
                    run_id.to_string(),
                    format!("Duplicate MID repair {step}: {}", outcome.message),
                )
                .entity_name(REPAIR_VERSION)
                .previous(outcome.snapshot.to_value())
                .new_data(Some(json!({ "step": step.as_str(), "affected": outcome.affected }))),
            );
        }

        Ok(RepairResponse {
            version: REPAIR_VERSION.to_string(),
            step: step.as_str().to_string(),
            mode: mode.as_str().to_string(),
            message: outcome.message,
            affected_count: outcome.affected,
            payouts: outcome.payouts,
            deals: outcome.deals,
        })
    }

    async fn count(&self) -> AppResult<StepOutcome> {
        let payouts = u64::try_from(self.repair.count_duplicate_payouts().await?).unwrap_or(0);
        let deals = u64::try_from(self.repair.count_duplicate_deals().await?).unwrap_or(0);
        Ok(StepOutcome {
            message: format!("Found {payouts} duplicate payout records and {deals} duplicate deal records"),
            affected: payouts + deals,
            payouts: Some(payouts),
            deals: Some(deals),
            snapshot: Snapshot::default(),
        })
    }

    /// Copy partner fields from each non-prefixed payout onto its prefixed
    /// twin. Pairs that already agree are left alone.
    async fn update_payouts(&self, mode: RepairMode) -> AppResult<StepOutcome> {
        let pairs: Vec<_> = self
            .repair
            .payout_pairs()
            .await?
            .into_iter()
            .filter(|pair| pair.source != pair.target)
            .collect();

        let mut before = Vec::new();
        let mut updated = 0;
        for pair in &pairs {
            if mode == RepairMode::DryRun {
                updated += 1;
                continue;
            }
            if let Some(target) = self.payouts.get(pair.target_id).await? {
                before.push(target);
            }
            updated += self.payouts.set_partner_fields(pair.target_id, &pair.source).await?;
        }

        let mut outcome = StepOutcome::affected(
            format!("Updated {updated} old payout records with correct partner info"),
            updated,
        );
        outcome.snapshot.payouts = before;
        Ok(outcome)
    }

    async fn update_deals(&self, mode: RepairMode) -> AppResult<StepOutcome> {
        let pairs: Vec<_> = self
            .repair
            .deal_pairs()
            .await?
            .into_iter()
            .filter(|pair| pair.source != pair.target)
            .collect();

        let mut before = Vec::new();
        let mut updated = 0;
        for pair in &pairs {
            if mode == RepairMode::DryRun {
                updated += 1;
                continue;
            }
            if let Some(target) = self.deals.get(pair.target_id).await? {
                before.push(target);
            }
            updated += self.deals.set_participants(pair.target_id, &pair.source).await?;
        }

        let mut outcome = StepOutcome::affected(
            format!("Updated {updated} old deal records with correct participants_json"),
            updated,
        );
        outcome.snapshot.deals = before;
        Ok(outcome)
    }

    /// Remove non-prefixed payouts. The sibling check is repeated per row
    /// right before the delete.
    async fn delete_payouts(&self, mode: RepairMode) -> AppResult<StepOutcome> {
        let candidates = self.repair.duplicate_payout_ids().await?;

        let mut before = Vec::new();
        let mut deleted = 0;
        for id in candidates {
            let Some(payout) = self.payouts.get(id).await? else {
                continue;
            };
            if !self.repair.payout_mid_exists(&prefixed_sibling(&payout.mid)).await? {
                warn!(payout_id = %id, mid = %payout.mid, "no prefixed sibling, keeping payout");
                continue;
            }
            if mode == RepairMode::DryRun {
                deleted += 1;
                continue;
            }
            deleted += self.payouts.delete(id).await?;
            before.push(payout);
        }

        let mut outcome = StepOutcome::affected(format!("Deleted {deleted} duplicate payout records"), deleted);
        outcome.snapshot.payouts = before;
        Ok(outcome)
    }

    /// Remove non-prefixed deals. Linked events are reset and their payouts
    /// removed first so nothing points at a deleted deal.
    async fn delete_deals(&self, mode: RepairMode) -> AppResult<StepOutcome> {
        let candidates = self.repair.duplicate_deals().await?;

        let mut snapshot = Snapshot::default();
        let mut deleted = 0;
        for candidate in candidates {
            if self.deals.find_by_mid(&prefixed_sibling(&candidate.mid)).await?.is_none() {
                warn!(deal_id = %candidate.id, mid = %candidate.mid, "no prefixed sibling, keeping deal");
                continue;
            }
            if mode == RepairMode::DryRun {
                deleted += 1;
                continue;
            }

            let Some(deal) = self.deals.get(candidate.id).await? else {
                continue;
            };
            let linked = self.events.list_by_deal(deal.id).await?;
            let event_ids: Vec<_> = linked.iter().map(|e| e.id).collect();
            snapshot.payouts.extend(self.payouts.list_for_events(&event_ids).await?);
            snapshot.payouts.extend(
                self.payouts
                    .list_for_deal_token(&deal.deal_id)
                    .await?
                    .into_iter()
                    .filter(|p| p.csv_data_id.map_or(true, |id| !event_ids.contains(&id))),
            );

            let report = self
                .cascade
                .run(vec![
                    CascadeStep::DeletePayoutsForEvents(event_ids.clone()),
                    CascadeStep::DeletePayoutsForDealToken(deal.deal_id.clone()),
                    CascadeStep::ResetEvents(event_ids),
                    CascadeStep::DeleteDeal(deal.id),
                ])
                .await;
            if report.failed() {
                return Err(AppError::Persistence(format!(
                    "Deleted {deleted} duplicate deal records before deal {} failed",
                    candidate.deal_id
                )));
            }
            deleted += report.affected("delete_deal");
            snapshot.events.extend(linked);
            snapshot.deals.push(deal);
        }

        let mut outcome = StepOutcome::affected(format!("Deleted {deleted} duplicate deal records"), deleted);
        outcome.snapshot = snapshot;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use residuals_common::participant::Participant;
    use residuals_common::types::AssignmentStatus;
    use rust_decimal::Decimal;

    use super::{RepairMode, RepairService, RepairStep};
    use crate::db::memory_pool;
    use crate::services::audit::HistoryRecorder;
    use crate::stores::deal::{DealStore, NewDeal};
    use crate::stores::history::HistoryStore;
    use crate::stores::payout::{NewPayout, PayoutFilter, PayoutStore};
    use crate::stores::repair::RepairStore;

    fn payout(mid: &str, partner: &str, split: i64) -> NewPayout {
        NewPayout {
            csv_data_id: None,
            deal_id: None,
            mid: mid.to_string(),
            merchant_name: None,
            payout_month: Some("2024-01".to_string()),
            payout_type: "residual".to_string(),
            volume: Decimal::ZERO,
            fees: Decimal::new(100, 0),
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            net_residual: Decimal::new(100, 0),
            partner_airtable_id: partner.to_string(),
            partner_name: Some(partner.to_uppercase()),
            partner_role: "Partner".to_string(),
            partner_split_pct: Decimal::new(split, 0),
            partner_payout_amount: Decimal::new(split, 0),
            assignment_status: AssignmentStatus::Confirmed,
        }
    }

    fn deal(mid: &str, partner: &str) -> NewDeal {
        NewDeal {
            deal_id: format!("deal_{mid}"),
            mid: mid.to_string(),
            participants: vec![Participant {
                partner_airtable_id: partner.to_string(),
                partner_name: partner.to_uppercase(),
                partner_role: "Partner".to_string(),
                split_pct: Decimal::new(100, 0),
            }],
            payout_type: "residual".to_string(),
            assigned_agent_name: None,
        }
    }

    async fn setup() -> (RepairService, PayoutStore, DealStore, RepairStore, HistoryRecorder) {
        let pool = memory_pool().await.expect("pool");
        let history = HistoryRecorder::start(HistoryStore::new(pool.clone()));
        (
            RepairService::new(pool.clone(), history.clone()),
            PayoutStore::new(pool.clone()),
            DealStore::new(pool.clone()),
            RepairStore::new(pool),
            history,
        )
    }

    #[test]
    fn step_names_parse() {
        for step in RepairStep::ALL {
            assert_eq!(step.as_str().parse::<RepairStep>().expect("parse"), step);
        }
        assert!("everything".parse::<RepairStep>().is_err());
    }

    #[tokio::test]
    async fn delete_keeps_rows_without_sibling() {
        let (svc, payouts, deals, _, _) = setup().await;
        payouts.insert(payout("22660744", "a", 50)).await.expect("insert");
        deals.create(deal("22660744", "a")).await.expect("deal");

        let out = svc.run(RepairStep::DeletePayouts, RepairMode::Commit).await.expect("payouts");
        assert_eq!(out.affected_count, 0);
        let out = svc.run(RepairStep::DeleteDeals, RepairMode::Commit).await.expect("deals");
        assert_eq!(out.affected_count, 0);

        assert_eq!(payouts.count(&PayoutFilter::default()).await.expect("count"), 1);
        assert!(deals.find_by_mid("22660744").await.expect("find").is_some());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let (svc, payouts, _, repair, _) = setup().await;
        payouts.insert(payout("22660744", "new", 50)).await.expect("insert");
        payouts.insert(payout("0022660744", "old", 50)).await.expect("insert");

        let out = svc.run(RepairStep::UpdatePayouts, RepairMode::DryRun).await.expect("dry");
        assert_eq!(out.affected_count, 1);
        assert_eq!(out.mode, "dry_run");

        let out = svc.run(RepairStep::DeletePayouts, RepairMode::DryRun).await.expect("dry");
        assert_eq!(out.affected_count, 1);
        assert_eq!(payouts.count(&PayoutFilter::default()).await.expect("count"), 2);
        assert!(repair.runs(super::REPAIR_VERSION).await.expect("runs").is_empty());
    }

    #[tokio::test]
    async fn full_repair_then_second_pass_is_noop() {
        let (svc, payouts, deals, repair, history) = setup().await;
        payouts.insert(payout("22660744", "new", 50)).await.expect("insert");
        let old = payouts.insert(payout("0022660744", "old", 50)).await.expect("insert");
        deals.create(deal("22660744", "new")).await.expect("deal");
        let old_deal = deals.create(deal("0022660744", "old")).await.expect("deal");

        let count = svc.run(RepairStep::Count, RepairMode::DryRun).await.expect("count");
        assert_eq!(count.payouts, Some(1));
        assert_eq!(count.deals, Some(1));

        for step in [
            RepairStep::UpdatePayouts,
            RepairStep::UpdateDeals,
            RepairStep::DeletePayouts,
            RepairStep::DeleteDeals,
        ] {
            let out = svc.run(step, RepairMode::Commit).await.expect("step");
            assert_eq!(out.affected_count, 1, "{step}");
        }

        let repaired = payouts.get(old.id).await.expect("get").expect("kept");
        assert_eq!(repaired.partner_airtable_id, "new");
        let repaired_deal = deals.get(old_deal.id).await.expect("get").expect("kept");
        assert_eq!(repaired_deal.participants[0].partner_airtable_id, "new");
        assert!(deals.find_by_mid("22660744").await.expect("find").is_none());

        for step in RepairStep::ALL {
            let out = svc.run(step, RepairMode::Commit).await.expect("second pass");
            assert_eq!(out.affected_count, 0, "{step}");
        }

        history.flush().await;
        let runs = repair.runs(super::REPAIR_VERSION).await.expect("runs");
        assert_eq!(runs.len(), 8);
    }
}
