use chrono::Utc;
use residuals_common::api::{
    MarkPaidRequest, MarkPaidResponse, PayoutListResponse, PayoutQuery, UpdateMerchantRequest,
    UpdateMerchantResponse, UpdatePayoutRequest,
};
use residuals_common::columns::is_payout_month;
use residuals_common::error::{AppError, AppResult};
use residuals_common::mid::normalize_mid;
use residuals_common::summary::{self, MonthlySummary, ParticipantSummary, QuarterlySummary};
use residuals_common::types::{ActionType, EntityType, PaidStatus, PayoutRecord, Snapshot};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::audit::HistoryRecorder;
use crate::stores::deal::DealStore;
use crate::stores::event::EventStore;
use crate::stores::history::NewAction;
use crate::stores::payout::{PayoutFilter, PayoutStore};

const DEFAULT_PAGE: i64 = 100;
const MAX_PAGE: i64 = 1000;

#[derive(Clone)]
pub struct PayoutService {
    payouts: PayoutStore,
    events: EventStore,
    deals: DealStore,
    history: HistoryRecorder,
    page_size: i64,
}

impl PayoutService {
    pub fn new(pool: SqlitePool, history: HistoryRecorder, page_size: i64) -> Self {
        Self {
            payouts: PayoutStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            deals: DealStore::new(pool),
            history,
            page_size,
        }
    }

    pub async fn list(&self, query: &PayoutQuery) -> AppResult<PayoutListResponse> {
        let filter = filter_from(query);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let offset = query.offset.unwrap_or(0).max(0);
        let total = self.payouts.count(&filter).await?;
        let payouts = self.payouts.list_page(&filter, limit, offset).await?;
        Ok(PayoutListResponse { payouts, total })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<PayoutRecord> {
        self.payouts
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payout not found".to_string()))
    }

    /// Edit one payout line. The deal and sibling payouts are left as they are.
    pub async fn update(&self, id: Uuid, request: &UpdatePayoutRequest) -> AppResult<PayoutRecord> {
        let before = self.get(id).await?;
        self.payouts
            .update_fields(
                id,
                request.partner_split_pct,
                request.partner_payout_amount,
                request.paid_status,
            )
            .await?;
        let after = self.get(id).await?;

        info!(payout_id = %id, mid = %after.mid, "payout edited");
        self.history.record(
            NewAction::new(
                ActionType::Update,
                EntityType::Payout,
                id.to_string(),
                format!("Edited payout for {} on MID {}", after.partner_airtable_id, after.mid),
            )
            .entity_name(after.mid.clone())
            .previous(payout_snapshot(vec![before]).to_value())
            .new_data(serde_json::to_value(&after).ok()),
        );
        Ok(after)
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        let before = self.get(id).await?;
        self.payouts.delete(id).await?;
        info!(payout_id = %id, mid = %before.mid, "payout deleted");
        self.history.record(
            NewAction::new(
                ActionType::Delete,
                EntityType::Payout,
                id.to_string(),
                format!("Deleted payout for {} on MID {}", before.partner_airtable_id, before.mid),
            )
            .entity_name(before.mid.clone())
            .previous(payout_snapshot(vec![before]).to_value()),
        );
        Ok(())
    }

    /// Flip every unpaid payout of one partner and month to paid.
    pub async fn mark_paid(&self, request: &MarkPaidRequest) -> AppResult<MarkPaidResponse> {
        let partner = request.partner_airtable_id.trim();
        if partner.is_empty() {
            return Err(AppError::validation("partner_airtable_id is required"));
        }
        if !is_payout_month(&request.payout_month) {
            return Err(AppError::InvalidInput(format!(
                "payout_month must be YYYY-MM, got {}",
                request.payout_month
            )));
        }

        let before = self
            .payouts
            .list_all(
                &PayoutFilter {
                    partner_airtable_id: Some(partner.to_string()),
                    payout_month: Some(request.payout_month.clone()),
                    paid_status: Some(PaidStatus::Unpaid),
                    ..PayoutFilter::default()
                },
                self.page_size,
            )
            .await?;
        let updated_count = self
            .payouts
            .mark_paid(partner, &request.payout_month, Utc::now())
            .await?;

        info!(partner, payout_month = %request.payout_month, updated_count, "payouts marked paid");
        self.history.record(
            NewAction::new(
                ActionType::BulkUpdate,
                EntityType::Payout,
                format!("{partner}:{}", request.payout_month),
                format!("Marked {updated_count} payout(s) paid for {partner} in {}", request.payout_month),
            )
            .previous(payout_snapshot(before).to_value())
            .new_data(Some(json!({ "paid_status": "paid", "updated_count": updated_count }))),
        );
        Ok(MarkPaidResponse { updated_count })
    }

    pub async fn months(&self) -> AppResult<Vec<String>> {
        self.payouts.distinct_months().await
    }

    pub async fn monthly_summary(&self, query: &PayoutQuery) -> AppResult<Vec<MonthlySummary>> {
        Ok(summary::monthly(&self.all(query).await?))
    }

    pub async fn quarterly_summary(&self, query: &PayoutQuery) -> AppResult<Vec<QuarterlySummary>> {
        Ok(summary::quarterly(&self.all(query).await?))
    }

    pub async fn participant_summary(&self, query: &PayoutQuery) -> AppResult<Vec<ParticipantSummary>> {
        Ok(summary::by_participant(&self.all(query).await?))
    }

    async fn all(&self, query: &PayoutQuery) -> AppResult<Vec<PayoutRecord>> {
        self.payouts.list_all(&filter_from(query), self.page_size).await
    }

    /// Re-key a merchant. Payouts are updated first and must succeed; events
    /// and deals follow and only produce warnings when they fail.
    pub async fn update_merchant(&self, request: &UpdateMerchantRequest) -> AppResult<UpdateMerchantResponse> {
        let old_mid = normalize_mid(&request.old_mid);
        if old_mid.is_empty() {
            return Err(AppError::validation("old_mid is required"));
        }
        let new_mid = request
            .new_mid
            .as_deref()
            .map(normalize_mid)
            .filter(|m| !m.is_empty());
        let new_name = request
            .new_merchant_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());
        if new_mid.is_none() && new_name.is_none() {
            return Err(AppError::validation("Provide a new MID or a new merchant name"));
        }
        let target_mid = new_mid.unwrap_or_else(|| old_mid.clone());

        let before_payouts = self
            .payouts
            .list_all(
                &PayoutFilter {
                    mid: Some(old_mid.clone()),
                    ..PayoutFilter::default()
                },
                self.page_size,
            )
            .await?;
        let before_deal = self.deals.find_by_mid(&old_mid).await?;

        let payouts_updated = self.payouts.update_merchant(&old_mid, &target_mid, new_name).await?;

        let mut warnings = Vec::new();
        let events_updated = match self.events.update_merchant(&old_mid, &target_mid, new_name).await {
            Ok(n) => n,
            Err(err) => {
                warn!(%old_mid, error = %err, "event merchant update failed");
                warnings.push(format!("events not updated: {err}"));
                0
            }
        };
        let deals_updated = if target_mid == old_mid {
            0
        } else {
            match self.deals.update_merchant(&old_mid, &target_mid).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(%old_mid, error = %err, "deal merchant update failed");
                    warnings.push(format!("deals not updated: {err}"));
                    0
                }
            }
        };

        info!(%old_mid, new_mid = %target_mid, payouts_updated, events_updated, deals_updated, "merchant updated");
        self.history.record(
            NewAction::new(
                ActionType::Update,
                EntityType::Merchant,
                old_mid.clone(),
                format!("Updated merchant {old_mid} to {target_mid}"),
            )
            .entity_name(target_mid.clone())
            .previous(
                Snapshot {
                    deals: before_deal.into_iter().collect(),
                    payouts: before_payouts,
                    ..Snapshot::default()
                }
                .to_value(),
            )
            .new_data(Some(json!({ "mid": target_mid, "merchant_name": new_name }))),
        );

        Ok(UpdateMerchantResponse {
            payouts_updated,
            events_updated,
            deals_updated,
            warnings,
        })
    }
}

fn filter_from(query: &PayoutQuery) -> PayoutFilter {
    PayoutFilter {
        payout_month: query.payout_month.clone(),
        partner_airtable_id: query.partner_airtable_id.clone(),
        paid_status: query.paid_status,
        mid: query.mid.as_deref().map(normalize_mid),
        ..PayoutFilter::default()
    }
}

fn payout_snapshot(payouts: Vec<PayoutRecord>) -> Snapshot {
    Snapshot {
        payouts,
        ..Snapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use residuals_common::api::{MarkPaidRequest, PayoutQuery, UpdateMerchantRequest, UpdatePayoutRequest};
    use residuals_common::types::{AssignmentStatus, PaidStatus};
    use rust_decimal::Decimal;

    use super::PayoutService;
    use crate::db::memory_pool;
    use crate::services::audit::HistoryRecorder;
    use crate::stores::history::HistoryStore;
    use crate::stores::payout::{NewPayout, PayoutStore};

    fn payout(partner: &str, month: &str, amount: i64) -> NewPayout {
        NewPayout {
            csv_data_id: None,
            deal_id: None,
            mid: "5500".to_string(),
            merchant_name: Some("Bakery".to_string()),
            payout_month: Some(month.to_string()),
            payout_type: "residual".to_string(),
            volume: Decimal::ZERO,
            fees: Decimal::new(amount * 2, 0),
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            net_residual: Decimal::new(amount * 2, 0),
            partner_airtable_id: partner.to_string(),
            partner_name: Some(partner.to_uppercase()),
            partner_role: "Partner".to_string(),
            partner_split_pct: Decimal::new(50, 0),
            partner_payout_amount: Decimal::new(amount, 0),
            assignment_status: AssignmentStatus::Confirmed,
        }
    }

    async fn setup() -> (PayoutService, PayoutStore) {
        let pool = memory_pool().await.expect("pool");
        let history = HistoryRecorder::start(HistoryStore::new(pool.clone()));
        (PayoutService::new(pool.clone(), history, 100), PayoutStore::new(pool))
    }

    #[tokio::test]
    async fn mark_paid_touches_only_the_partner_month() {
        let (svc, store) = setup().await;
        store.insert(payout("a", "2024-01", 10)).await.expect("insert");
        store.insert(payout("a", "2024-01", 20)).await.expect("insert");
        store.insert(payout("a", "2024-02", 30)).await.expect("insert");
        store.insert(payout("b", "2024-01", 40)).await.expect("insert");

        let out = svc
            .mark_paid(&MarkPaidRequest {
                partner_airtable_id: "a".to_string(),
                payout_month: "2024-01".to_string(),
            })
            .await
            .expect("mark");
        assert_eq!(out.updated_count, 2);

        let again = svc
            .mark_paid(&MarkPaidRequest {
                partner_airtable_id: "a".to_string(),
                payout_month: "2024-01".to_string(),
            })
            .await
            .expect("mark again");
        assert_eq!(again.updated_count, 0);

        let paid = svc
            .list(&PayoutQuery {
                paid_status: Some(PaidStatus::Paid),
                ..PayoutQuery::default()
            })
            .await
            .expect("list");
        assert_eq!(paid.total, 2);
        assert!(paid.payouts.iter().all(|p| p.paid_at.is_some()));
    }

    #[tokio::test]
    async fn direct_edit_does_not_touch_siblings() {
        let (svc, store) = setup().await;
        let edited = store.insert(payout("a", "2024-01", 10)).await.expect("insert");
        let sibling = store.insert(payout("b", "2024-01", 10)).await.expect("insert");

        let after = svc
            .update(
                edited.id,
                &UpdatePayoutRequest {
                    partner_split_pct: Some(Decimal::new(60, 0)),
                    partner_payout_amount: Some(Decimal::new(12, 0)),
                    paid_status: None,
                },
            )
            .await
            .expect("update");
        assert_eq!(after.partner_split_pct, Decimal::new(60, 0));

        let untouched = svc.get(sibling.id).await.expect("sibling");
        assert_eq!(untouched.partner_split_pct, Decimal::new(50, 0));
    }

    #[tokio::test]
    async fn summaries_fold_by_month_and_quarter() {
        let (svc, store) = setup().await;
        store.insert(payout("a", "2024-01", 10)).await.expect("insert");
        store.insert(payout("b", "2024-02", 20)).await.expect("insert");
        store.insert(payout("a", "2024-04", 30)).await.expect("insert");

        let monthly = svc.monthly_summary(&PayoutQuery::default()).await.expect("monthly");
        assert_eq!(monthly.len(), 3);
        assert_eq!(monthly[0].payout_month, "2024-04");

        let quarterly = svc.quarterly_summary(&PayoutQuery::default()).await.expect("quarterly");
        assert_eq!(quarterly[0].quarter, "2024-Q2");
        assert_eq!(quarterly[1].quarter, "2024-Q1");
        assert_eq!(quarterly[1].totals.total_amount, Decimal::new(30, 0));
    }

    #[tokio::test]
    async fn merchant_rekey_moves_payouts() {
        let (svc, store) = setup().await;
        store.insert(payout("a", "2024-01", 10)).await.expect("insert");

        let out = svc
            .update_merchant(&UpdateMerchantRequest {
                old_mid: "5500".to_string(),
                new_mid: Some("005500".to_string()),
                new_merchant_name: Some("Bakery & Co".to_string()),
            })
            .await
            .expect("rekey");
        assert_eq!(out.payouts_updated, 1);
        assert!(out.warnings.is_empty());

        let moved = svc
            .list(&PayoutQuery {
                mid: Some("005500".to_string()),
                ..PayoutQuery::default()
            })
            .await
            .expect("list");
        assert_eq!(moved.payouts[0].merchant_name.as_deref(), Some("Bakery & Co"));
    }
}
