use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::participant::Participant;
use crate::types::{DealRecord, EventRecord, PaidStatus, PayoutRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub ok: bool,
    pub boot_id: Option<String>,
    pub git_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportEventsRequest {
    pub rows: Vec<Map<String, Value>>,
    #[serde(default)]
    pub payout_month: Option<String>,
    #[serde(default)]
    pub payout_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportEventsResponse {
    pub batch_id: String,
    pub imported: usize,
    pub duplicates: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventQuery {
    /// A status name, `pending_confirmation` (pending or its alias), or `all`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub payout_month: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventListResponse {
    pub events: Vec<EventRecord>,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusStats {
    pub count: i64,
    pub volume: Decimal,
    pub fees: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventStats {
    pub unassigned: StatusStats,
    pub pending: StatusStats,
    pub confirmed: StatusStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub batch_id: String,
    pub payout_month: Option<String>,
    pub total_rows: i64,
    pub unassigned_rows: i64,
    pub imported_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventIdsRequest {
    pub event_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldEventsRequest {
    pub event_ids: Vec<Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BulkPayoutMonthRequest {
    pub event_ids: Vec<Uuid>,
    pub payout_month: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatedCountResponse {
    pub updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteEventsResponse {
    pub deleted: u64,
    /// Ids left in place because they are no longer unassigned.
    pub skipped: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignParticipantsRequest {
    pub mid: String,
    #[serde(default)]
    pub payout_type: Option<String>,
    pub participants: Vec<Participant>,
    pub event_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignParticipantsResponse {
    pub deal_id: Uuid,
    pub deal_token: String,
    pub created: bool,
    pub events_updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmEventsResponse {
    pub confirmed_count: usize,
    pub payouts_created: usize,
    pub payouts_updated: u64,
    pub failed_event_ids: Vec<Uuid>,
    pub external_sync_summary: ExternalSyncSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalSyncSummary {
    pub attempted: usize,
    pub synced: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeStepReport {
    pub step: String,
    pub affected: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CascadeReport {
    pub steps: Vec<CascadeStepReport>,
}

impl CascadeReport {
    pub fn affected(&self, step: &str) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.step == step)
            .map(|s| s.affected)
            .sum()
    }

    pub fn failed(&self) -> bool {
        self.steps.iter().any(|s| s.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectDealResponse {
    pub success: bool,
    pub events_reset: u64,
    pub payouts_deleted: u64,
    pub cascade: CascadeReport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DealQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DealListResponse {
    pub deals: Vec<DealRecord>,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateDealRequest {
    #[serde(rename = "participants_json")]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub payout_type: Option<String>,
    #[serde(default)]
    pub available_to_purchase: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PayoutQuery {
    #[serde(default)]
    pub payout_month: Option<String>,
    #[serde(default)]
    pub partner_airtable_id: Option<String>,
    #[serde(default)]
    pub paid_status: Option<PaidStatus>,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutListResponse {
    pub payouts: Vec<PayoutRecord>,
    pub total: i64,
}

/// Direct edit of one payout line. Edits never reflow into the deal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayoutRequest {
    #[serde(default)]
    pub partner_split_pct: Option<Decimal>,
    #[serde(default)]
    pub partner_payout_amount: Option<Decimal>,
    #[serde(default)]
    pub paid_status: Option<PaidStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkPaidRequest {
    pub partner_airtable_id: String,
    pub payout_month: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkPaidResponse {
    pub updated_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMerchantRequest {
    pub old_mid: String,
    #[serde(default)]
    pub new_mid: Option<String>,
    #[serde(default)]
    pub new_merchant_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMerchantResponse {
    pub payouts_updated: u64,
    pub events_updated: u64,
    pub deals_updated: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncRequest {
    #[serde(default)]
    pub month: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryQuery {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub include_undone: Option<bool>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UndoResponse {
    pub success: bool,
    pub undo_action_id: Uuid,
    pub restored_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairRequest {
    pub step: String,
    #[serde(default)]
    pub commit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairResponse {
    pub version: String,
    pub step: String,
    pub mode: String,
    pub message: String,
    pub affected_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payouts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deals: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatusResponse {
    pub configured: bool,
    pub confirmed_payouts: i64,
    pub unpaid_payouts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfigResponse {
    pub base_id: Option<String>,
    pub table_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateSyncConfigRequest {
    #[serde(default)]
    pub base_id: Option<String>,
    #[serde(default)]
    pub table_id: Option<String>,
}
