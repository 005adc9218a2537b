use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use residuals_common::api::{ExternalSyncSummary, SyncStatusResponse};
use residuals_common::config::CpConfig;
use residuals_common::error::AppResult;
use residuals_common::types::{AssignmentStatus, PaidStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::airtable::{ExternalPayoutStore, ExternalRecord, ExternalUpdate, PayoutFields, COMPARED_FIELDS};
use crate::stores::payout::{PayoutFilter, PayoutStore};

const NUMBER_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedRecord {
    pub record_id: String,
    pub payout_id: String,
    /// New values for the changed fields only.
    pub fields: Map<String, Value>,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncTotals {
    pub local: usize,
    pub remote: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncComparison {
    pub new: Vec<PayoutFields>,
    pub changed: Vec<ChangedRecord>,
    pub unchanged_count: usize,
    pub totals: SyncTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplySyncRequest {
    #[serde(default)]
    pub new: Vec<PayoutFields>,
    #[serde(default)]
    pub changed: Vec<ChangedRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncApplyResult {
    pub created_count: usize,
    pub updated_count: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub comparison: SyncComparison,
    pub applied: SyncApplyResult,
}

/// Reconciles local payouts with the external mirror.
#[derive(Clone)]
pub struct SyncService {
    payouts: PayoutStore,
    external: Arc<dyn ExternalPayoutStore>,
    batch_size: usize,
    batch_delay: Duration,
    page_size: i64,
}

impl SyncService {
    pub fn new(pool: SqlitePool, external: Arc<dyn ExternalPayoutStore>, config: &CpConfig) -> Self {
        Self {
            payouts: PayoutStore::new(pool),
            external,
            batch_size: config.sync_batch_size.max(1),
            batch_delay: Duration::from_millis(config.sync_batch_delay_ms),
            page_size: config.local_page_size,
        }
    }

    /// Classify every local payout (optionally for one month) as new, changed
    /// or unchanged against the external table. Read-only.
    pub async fn compare(&self, month: Option<&str>) -> AppResult<SyncComparison> {
        let filter = PayoutFilter {
            payout_month: month.map(ToString::to_string),
            ..PayoutFilter::default()
        };
        let local = self.payouts.list_all(&filter, self.page_size).await?;
        let remote = self.fetch_remote(None).await?;

        let mut comparison = SyncComparison::default();
        for payout in &local {
            let fields = PayoutFields::from_payout(payout);
            match remote.get(&fields.payout_id) {
                None => comparison.new.push(fields),
                Some(record) => match changed_fields(&fields, record) {
                    Some(changed) => comparison.changed.push(changed),
                    None => comparison.unchanged_count += 1,
                },
            }
        }
        comparison.totals = SyncTotals {
            local: local.len(),
            remote: remote.len(),
            new: comparison.new.len(),
            changed: comparison.changed.len(),
            unchanged: comparison.unchanged_count,
        };

        info!(
            month = month.unwrap_or("all"),
            local = comparison.totals.local,
            remote = comparison.totals.remote,
            new = comparison.totals.new,
            changed = comparison.totals.changed,
            unchanged = comparison.totals.unchanged,
            "sync comparison finished"
        );
        Ok(comparison)
    }

    /// Push creates then updates in throttled batches. A failed batch is
    /// recorded and the remaining batches still run.
    pub async fn apply(&self, request: &ApplySyncRequest) -> SyncApplyResult {
        let mut result = SyncApplyResult::default();
        let mut batch_no = 0usize;

        for chunk in request.new.chunks(self.batch_size) {
            batch_no += 1;
            self.throttle(batch_no).await;
            match self.external.create_records(chunk).await {
                Ok(_) => result.created_count += chunk.len(),
                Err(err) => {
                    warn!(batch = batch_no, records = chunk.len(), error = %err, "sync create batch failed");
                    result.errors.push(format!("Batch {batch_no}: {err}"));
                }
            }
        }

        let updates: Vec<ExternalUpdate> = request
            .changed
            .iter()
            .map(|c| ExternalUpdate {
                id: c.record_id.clone(),
                fields: c.fields.clone(),
            })
            .collect();
        for chunk in updates.chunks(self.batch_size) {
            batch_no += 1;
            self.throttle(batch_no).await;
            match self.external.update_records(chunk).await {
                Ok(_) => result.updated_count += chunk.len(),
                Err(err) => {
                    warn!(batch = batch_no, records = chunk.len(), error = %err, "sync update batch failed");
                    result.errors.push(format!("Batch {batch_no}: {err}"));
                }
            }
        }

        info!(
            created = result.created_count,
            updated = result.updated_count,
            errors = result.errors.len(),
            "sync apply finished"
        );
        result
    }

    pub async fn run(&self, month: Option<&str>) -> AppResult<SyncRunResult> {
        let comparison = self.compare(month).await?;
        let applied = self
            .apply(&ApplySyncRequest {
                new: comparison.new.clone(),
                changed: comparison.changed.clone(),
            })
            .await;
        Ok(SyncRunResult { comparison, applied })
    }

    /// Confirm-time push of specific payouts. Existing records are overwritten
    /// without comparison and rows with a zero split are not mirrored. Never
    /// fails; problems land in the summary.
    pub async fn push_payouts(&self, payout_ids: &[Uuid]) -> ExternalSyncSummary {
        let mut summary = ExternalSyncSummary::default();
        let payouts = match self.payouts.get_many(payout_ids).await {
            Ok(payouts) => payouts,
            Err(err) => {
                summary.errors.push(err.to_string());
                return summary;
            }
        };
        let fields: Vec<PayoutFields> = payouts
            .iter()
            .filter(|p| p.partner_split_pct > Decimal::ZERO)
            .map(PayoutFields::from_payout)
            .collect();
        summary.attempted = fields.len();
        if fields.is_empty() {
            return summary;
        }

        let mut existing = HashMap::new();
        for chunk in fields.chunks(self.batch_size) {
            let ids: Vec<String> = chunk.iter().map(|f| f.payout_id.clone()).collect();
            match self.fetch_remote(Some(ids.as_slice())).await {
                Ok(found) => existing.extend(found),
                Err(err) => {
                    warn!(error = %err, "confirm-time sync lookup failed");
                    summary.errors.push(err.to_string());
                    return summary;
                }
            }
        }

        let mut request = ApplySyncRequest::default();
        for f in fields {
            match existing.get(&f.payout_id) {
                Some(record) => request.changed.push(ChangedRecord {
                    record_id: record.id.clone(),
                    payout_id: f.payout_id.clone(),
                    fields: f.to_map(),
                    changed_fields: Vec::new(),
                }),
                None => request.new.push(f),
            }
        }

        let applied = self.apply(&request).await;
        summary.created = applied.created_count;
        summary.updated = applied.updated_count;
        summary.synced = applied.created_count + applied.updated_count;
        summary.errors = applied.errors;
        summary
    }

    pub async fn status(&self) -> AppResult<SyncStatusResponse> {
        status_counts(&self.payouts, true).await
    }

    async fn fetch_remote(&self, payout_ids: Option<&[String]>) -> AppResult<HashMap<String, ExternalRecord>> {
        let mut by_payout = HashMap::new();
        let mut offset: Option<String> = None;
        loop {
            let page = self.external.list_page(payout_ids, offset.as_deref()).await?;
            for record in page.records {
                if let Some(payout_id) = record.payout_id().map(ToString::to_string) {
                    by_payout.insert(payout_id, record);
                }
            }
            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }
        Ok(by_payout)
    }

    async fn throttle(&self, batch_no: usize) {
        if batch_no > 1 && !self.batch_delay.is_zero() {
            tokio::time::sleep(self.batch_delay).await;
        }
    }
}

pub async fn status_counts(payouts: &PayoutStore, configured: bool) -> AppResult<SyncStatusResponse> {
    let confirmed_payouts = payouts
        .count(&PayoutFilter {
            assignment_status: Some(AssignmentStatus::Confirmed),
            ..PayoutFilter::default()
        })
        .await?;
    let unpaid_payouts = payouts
        .count(&PayoutFilter {
            paid_status: Some(PaidStatus::Unpaid),
            ..PayoutFilter::default()
        })
        .await?;
    Ok(SyncStatusResponse {
        configured,
        confirmed_payouts,
        unpaid_payouts,
    })
}

/// `None` when every compared field matches.
fn changed_fields(local: &PayoutFields, remote: &ExternalRecord) -> Option<ChangedRecord> {
    let local_map = local.to_map();
    let mut fields = Map::new();
    let mut changed = Vec::new();
    for name in COMPARED_FIELDS {
        let value = local_map.get(name).cloned().unwrap_or(Value::Null);
        if !values_match(&value, remote.fields.get(name)) {
            changed.push(name.to_string());
            fields.insert(name.to_string(), value);
        }
    }
    if changed.is_empty() {
        return None;
    }
    Some(ChangedRecord {
        record_id: remote.id.clone(),
        payout_id: local.payout_id.clone(),
        fields,
        changed_fields: changed,
    })
}

/// The external table omits empty cells, so a missing remote value counts as
/// zero for numbers and as the empty string otherwise.
fn values_match(local: &Value, remote: Option<&Value>) -> bool {
    let remote = remote.unwrap_or(&Value::Null);
    if let Some(local_number) = local.as_f64() {
        let remote_number = match remote {
            Value::Number(n) => n.as_f64().unwrap_or_default(),
            Value::String(s) => s.trim().parse().unwrap_or_default(),
            _ => 0.0,
        };
        return (local_number - remote_number).abs() < NUMBER_TOLERANCE;
    }
    text_of(local) == text_of(remote)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use residuals_common::config::CpConfig;
    use residuals_common::error::{AppError, AppResult};
    use residuals_common::types::{AssignmentStatus, PaidStatus};
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{values_match, ApplySyncRequest, SyncService};
    use crate::db::memory_pool;
    use crate::services::airtable::{ExternalPage, ExternalPayoutStore, ExternalRecord, ExternalUpdate, PayoutFields};
    use crate::stores::payout::{NewPayout, PayoutStore};

    /// In-memory external table with two-record pages.
    #[derive(Default)]
    struct FakeTable {
        records: Mutex<Vec<ExternalRecord>>,
        fail_creates: bool,
    }

    #[async_trait]
    impl ExternalPayoutStore for FakeTable {
        async fn list_page(&self, payout_ids: Option<&[String]>, offset: Option<&str>) -> AppResult<ExternalPage> {
            let records = self.records.lock().expect("lock");
            let matching: Vec<ExternalRecord> = records
                .iter()
                .filter(|r| {
                    payout_ids.map_or(true, |ids| r.payout_id().is_some_and(|id| ids.iter().any(|i| i == id)))
                })
                .cloned()
                .collect();
            let start: usize = offset.map(|o| o.parse().expect("offset")).unwrap_or(0);
            let end = (start + 2).min(matching.len());
            Ok(ExternalPage {
                records: matching[start..end].to_vec(),
                offset: (end < matching.len()).then(|| end.to_string()),
            })
        }

        async fn create_records(&self, records: &[PayoutFields]) -> AppResult<usize> {
            if self.fail_creates {
                return Err(AppError::External("airtable http 422".to_string()));
            }
            let mut table = self.records.lock().expect("lock");
            for fields in records {
                let id = format!("rec{}", table.len() + 1);
                table.push(ExternalRecord {
                    id,
                    fields: fields.to_map(),
                });
            }
            Ok(records.len())
        }

        async fn update_records(&self, updates: &[ExternalUpdate]) -> AppResult<usize> {
            let mut table = self.records.lock().expect("lock");
            for update in updates {
                let record = table.iter_mut().find(|r| r.id == update.id).expect("record");
                for (k, v) in &update.fields {
                    record.fields.insert(k.clone(), v.clone());
                }
            }
            Ok(updates.len())
        }
    }

    fn config() -> CpConfig {
        let mut config = CpConfig::from_map(&HashMap::new()).expect("config");
        config.sync_batch_delay_ms = 0;
        config.local_page_size = 2;
        config
    }

    fn payout(mid: &str, pct: i64) -> NewPayout {
        NewPayout {
            csv_data_id: None,
            deal_id: Some("deal_x".to_string()),
            mid: mid.to_string(),
            merchant_name: Some("Shop".to_string()),
            payout_month: Some("2024-06".to_string()),
            payout_type: "residual".to_string(),
            volume: Decimal::new(1000, 0),
            fees: Decimal::new(100, 0),
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            net_residual: Decimal::new(100, 0),
            partner_airtable_id: "recPartner".to_string(),
            partner_name: Some("Ada".to_string()),
            partner_role: "Partner".to_string(),
            partner_split_pct: Decimal::new(pct, 0),
            partner_payout_amount: Decimal::new(pct, 0),
            assignment_status: AssignmentStatus::Confirmed,
        }
    }

    #[test]
    fn missing_remote_values_match_zero_and_empty() {
        assert!(values_match(&json!(0.0), None));
        assert!(values_match(&json!(null), None));
        assert!(values_match(&json!(35.0), Some(&json!("35"))));
        assert!(!values_match(&json!("paid"), Some(&json!("unpaid"))));
    }

    #[tokio::test]
    async fn second_run_without_local_changes_is_a_no_op() {
        let pool = memory_pool().await.expect("pool");
        let store = PayoutStore::new(pool.clone());
        for i in 0..5 {
            store.insert(payout(&format!("m{i}"), 50)).await.expect("insert");
        }
        let table = Arc::new(FakeTable::default());
        let svc = SyncService::new(pool, table.clone(), &config());

        let first = svc.run(None).await.expect("first run");
        assert_eq!(first.comparison.new.len(), 5);
        assert_eq!(first.applied.created_count, 5);

        let second = svc.compare(None).await.expect("compare");
        assert!(second.new.is_empty());
        assert!(second.changed.is_empty());
        assert_eq!(second.unchanged_count, 5);
    }

    #[tokio::test]
    async fn paid_status_change_is_detected_and_pushed() {
        let pool = memory_pool().await.expect("pool");
        let store = PayoutStore::new(pool.clone());
        let row = store.insert(payout("m1", 50)).await.expect("insert");
        let svc = SyncService::new(pool, Arc::new(FakeTable::default()), &config());
        svc.run(None).await.expect("seed");

        store
            .update_fields(row.id, None, None, Some(PaidStatus::Paid))
            .await
            .expect("paid");
        let comparison = svc.compare(None).await.expect("compare");
        assert_eq!(comparison.changed.len(), 1);
        let changed = &comparison.changed[0];
        assert!(changed.changed_fields.contains(&"Paid Status".to_string()));
        assert!(changed.changed_fields.contains(&"Paid At".to_string()));
        assert!(!changed.fields.contains_key("MID"));
    }

    #[tokio::test]
    async fn failed_batches_are_reported_and_others_continue() {
        let pool = memory_pool().await.expect("pool");
        let table = Arc::new(FakeTable {
            fail_creates: true,
            ..FakeTable::default()
        });
        let mut config = config();
        config.sync_batch_size = 2;
        let svc = SyncService::new(pool, table, &config);

        let new: Vec<PayoutFields> = (0..3)
            .map(|i| {
                let mut fields = PayoutFields::from_payout(&sample_record(i));
                fields.payout_id = format!("p{i}");
                fields
            })
            .collect();
        let result = svc
            .apply(&ApplySyncRequest {
                new,
                changed: Vec::new(),
            })
            .await;

        assert_eq!(result.created_count, 0);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[0].starts_with("Batch 1: "));
        assert!(result.errors[1].starts_with("Batch 2: "));
    }

    #[tokio::test]
    async fn confirm_push_skips_zero_split_rows() {
        let pool = memory_pool().await.expect("pool");
        let store = PayoutStore::new(pool.clone());
        let paid = store.insert(payout("m1", 40)).await.expect("insert");
        let zero = store.insert(payout("m2", 0)).await.expect("insert");
        let table = Arc::new(FakeTable::default());
        let svc = SyncService::new(pool, table.clone(), &config());

        let summary = svc.push_payouts(&[paid.id, zero.id]).await;
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.created, 1);

        let again = svc.push_payouts(&[paid.id]).await;
        assert_eq!(again.updated, 1);
        assert_eq!(table.records.lock().expect("lock").len(), 1);
    }

    fn sample_record(i: i64) -> residuals_common::types::PayoutRecord {
        let now = chrono::Utc::now();
        residuals_common::types::PayoutRecord {
            id: uuid::Uuid::new_v4(),
            csv_data_id: None,
            deal_id: None,
            mid: format!("m{i}"),
            merchant_name: None,
            payout_month: Some("2024-06".to_string()),
            payout_date: None,
            payout_type: "residual".to_string(),
            volume: Decimal::ZERO,
            fees: Decimal::ZERO,
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            net_residual: Decimal::ZERO,
            partner_airtable_id: "rec".to_string(),
            partner_name: None,
            partner_role: "Partner".to_string(),
            partner_split_pct: Decimal::new(10, 0),
            partner_payout_amount: Decimal::ZERO,
            assignment_status: AssignmentStatus::Confirmed,
            paid_status: PaidStatus::Unpaid,
            paid_at: None,
            is_legacy_import: false,
            created_at: now,
            updated_at: now,
        }
    }
}
