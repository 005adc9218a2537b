use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::participant::Participant;

pub const DEFAULT_PAYOUT_TYPE: &str = "residual";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Unassigned,
    Pending,
    PendingConfirmation,
    Confirmed,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Pending => "pending",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Confirmed => "confirmed",
        }
    }

    /// `pending_confirmation` is an alias of `pending` for filtering.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending | Self::PendingConfirmation)
    }
}

impl FromStr for AssignmentStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "unassigned" => Ok(Self::Unassigned),
            "pending" => Ok(Self::Pending),
            "pending_confirmation" => Ok(Self::PendingConfirmation),
            "confirmed" => Ok(Self::Confirmed),
            _ => Err(AppError::InvalidInput(format!(
                "invalid assignment status: {raw}"
            ))),
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaidStatus {
    Unpaid,
    Paid,
}

impl PaidStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
        }
    }
}

impl FromStr for PaidStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "unpaid" => Ok(Self::Unpaid),
            "paid" => Ok(Self::Paid),
            _ => Err(AppError::InvalidInput(format!("invalid paid status: {raw}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
    Import,
    Sync,
    Undo,
    Merge,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::BulkUpdate => "bulk_update",
            Self::BulkDelete => "bulk_delete",
            Self::Import => "import",
            Self::Sync => "sync",
            Self::Undo => "undo",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for ActionType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "bulk_update" => Ok(Self::BulkUpdate),
            "bulk_delete" => Ok(Self::BulkDelete),
            "import" => Ok(Self::Import),
            "sync" => Ok(Self::Sync),
            "undo" => Ok(Self::Undo),
            "merge" => Ok(Self::Merge),
            _ => Err(AppError::InvalidInput(format!("invalid action type: {raw}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Event,
    Deal,
    Payout,
    Assignment,
    Merchant,
    Setting,
    Maintenance,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Deal => "deal",
            Self::Payout => "payout",
            Self::Assignment => "assignment",
            Self::Merchant => "merchant",
            Self::Setting => "setting",
            Self::Maintenance => "maintenance",
        }
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "event" => Ok(Self::Event),
            "deal" => Ok(Self::Deal),
            "payout" => Ok(Self::Payout),
            "assignment" => Ok(Self::Assignment),
            "merchant" => Ok(Self::Merchant),
            "setting" => Ok(Self::Setting),
            "maintenance" => Ok(Self::Maintenance),
            _ => Err(AppError::InvalidInput(format!("invalid entity type: {raw}"))),
        }
    }
}

/// One imported row of processor revenue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub row_hash: String,
    pub batch_id: String,
    pub mid: String,
    pub merchant_name: Option<String>,
    pub volume: Decimal,
    pub fees: Decimal,
    pub adjustments: Decimal,
    pub chargebacks: Decimal,
    pub date: Option<String>,
    pub payout_month: Option<String>,
    pub payout_type: String,
    pub assignment_status: AssignmentStatus,
    /// Row id of the deal this event is assigned to.
    pub deal_id: Option<Uuid>,
    pub assigned_agent_id: Option<String>,
    pub assigned_agent_name: Option<String>,
    pub is_held: bool,
    pub hold_reason: Option<String>,
    pub raw_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The current participant split for one merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: Uuid,
    /// Human readable token, also stamped on payouts.
    pub deal_id: String,
    pub mid: String,
    #[serde(rename = "participants_json")]
    pub participants: Vec<Participant>,
    pub payout_type: String,
    pub assigned_agent_name: Option<String>,
    pub available_to_purchase: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: Uuid,
    pub csv_data_id: Option<Uuid>,
    /// Deal token, not the deal row id.
    pub deal_id: Option<String>,
    pub mid: String,
    pub merchant_name: Option<String>,
    pub payout_month: Option<String>,
    pub payout_date: Option<String>,
    pub payout_type: String,
    pub volume: Decimal,
    pub fees: Decimal,
    pub adjustments: Decimal,
    pub chargebacks: Decimal,
    pub net_residual: Decimal,
    pub partner_airtable_id: String,
    pub partner_name: Option<String>,
    pub partner_role: String,
    pub partner_split_pct: Decimal,
    pub partner_payout_amount: Decimal,
    pub assignment_status: AssignmentStatus,
    pub paid_status: PaidStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub is_legacy_import: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub action_type: ActionType,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub previous_data: Option<Value>,
    pub new_data: Option<Value>,
    pub description: String,
    pub request_id: Option<String>,
    pub batch_id: Option<String>,
    pub is_undone: bool,
    pub undone_at: Option<DateTime<Utc>>,
    pub undo_action_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Row images captured before a mutation. Undo writes these rows back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub deals: Vec<DealRecord>,
    pub events: Vec<EventRecord>,
    pub payouts: Vec<PayoutRecord>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.deals.is_empty() && self.events.is_empty() && self.payouts.is_empty()
    }

    pub fn to_value(&self) -> Option<Value> {
        serde_json::to_value(self).ok()
    }
}
