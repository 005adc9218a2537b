use chrono::Utc;
use residuals_common::error::{AppError, AppResult};
use residuals_common::participant::{normalize_list, Participant};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{column, db_err, decimal_column, uuid_column};
use crate::stores::payout::PartnerFields;

/// Queries behind the duplicate-MID repair. A "duplicate" is a row whose
/// merchant id has a sibling carrying the same id with a `00` prefix.
#[derive(Clone)]
pub struct RepairStore {
    pool: SqlitePool,
}

/// A prefixed payout row and the partner fields it should take from its
/// non-prefixed twin.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutPair {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source: PartnerFields,
    pub target: PartnerFields,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DealPair {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source: Vec<Participant>,
    pub target: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateDeal {
    pub id: Uuid,
    pub deal_id: String,
    pub mid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairRun {
    pub id: Uuid,
    pub version: String,
    pub step: String,
    pub affected: i64,
    pub created_at: String,
}

impl RepairStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count_duplicate_payouts(&self) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payouts p1 WHERE p1.mid NOT LIKE '00%' \
             AND EXISTS (SELECT 1 FROM payouts p2 WHERE p2.mid = '00' || p1.mid)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("failed to count duplicate payouts"))
    }

    pub async fn count_duplicate_deals(&self) -> AppResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM deals d1 WHERE d1.mid NOT LIKE '00%' \
             AND EXISTS (SELECT 1 FROM deals d2 WHERE d2.mid = '00' || d1.mid)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("failed to count duplicate deals"))
    }

    /// Pairs matched on merchant id, payout month and split percentage.
    pub async fn payout_pairs(&self) -> AppResult<Vec<PayoutPair>> {
        let rows = sqlx::query(
            "SELECT n.id AS source_id, o.id AS target_id, \
             n.partner_airtable_id AS s_partner_id, n.partner_name AS s_partner_name, n.partner_role AS s_partner_role, \
             n.partner_split_pct AS s_split, n.partner_payout_amount AS s_amount, \
             o.partner_airtable_id AS t_partner_id, o.partner_name AS t_partner_name, o.partner_role AS t_partner_role, \
             o.partner_split_pct AS t_split, o.partner_payout_amount AS t_amount \
             FROM payouts n JOIN payouts o ON o.mid = '00' || n.mid \
             AND o.payout_month IS n.payout_month AND o.partner_split_pct = n.partner_split_pct \
             WHERE n.mid NOT LIKE '00%' ORDER BY n.created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to match duplicate payouts"))?;

        rows.into_iter()
            .map(|row| {
                Ok(PayoutPair {
                    source_id: uuid_column(&row, "source_id")?,
                    target_id: uuid_column(&row, "target_id")?,
                    source: PartnerFields {
                        partner_airtable_id: column(&row, "s_partner_id")?,
                        partner_name: column(&row, "s_partner_name")?,
                        partner_role: column(&row, "s_partner_role")?,
                        partner_split_pct: decimal_column(&row, "s_split")?,
                        partner_payout_amount: decimal_column(&row, "s_amount")?,
                    },
                    target: PartnerFields {
                        partner_airtable_id: column(&row, "t_partner_id")?,
                        partner_name: column(&row, "t_partner_name")?,
                        partner_role: column(&row, "t_partner_role")?,
                        partner_split_pct: decimal_column(&row, "t_split")?,
                        partner_payout_amount: decimal_column(&row, "t_amount")?,
                    },
                })
            })
            .collect()
    }

    pub async fn deal_pairs(&self) -> AppResult<Vec<DealPair>> {
        let rows = sqlx::query(
            "SELECT n.id AS source_id, o.id AS target_id, n.participants_json AS source, o.participants_json AS target \
             FROM deals n JOIN deals o ON o.mid = '00' || n.mid WHERE n.mid NOT LIKE '00%' ORDER BY n.created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to match duplicate deals"))?;

        rows.into_iter()
            .map(|row| {
                let source: String = column(&row, "source")?;
                let target: String = column(&row, "target")?;
                Ok(DealPair {
                    source_id: uuid_column(&row, "source_id")?,
                    target_id: uuid_column(&row, "target_id")?,
                    source: parse_participants(&source)?,
                    target: parse_participants(&target)?,
                })
            })
            .collect()
    }

    /// Non-prefixed payouts whose prefixed sibling exists.
    pub async fn duplicate_payout_ids(&self) -> AppResult<Vec<Uuid>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT p1.id FROM payouts p1 WHERE p1.mid NOT LIKE '00%' \
             AND EXISTS (SELECT 1 FROM payouts p2 WHERE p2.mid = '00' || p1.mid)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list duplicate payouts"))?;

        ids.iter()
            .map(|id| {
                Uuid::parse_str(id).map_err(|e| AppError::Persistence(format!("invalid payout id: {e}")))
            })
            .collect()
    }

    pub async fn duplicate_deals(&self) -> AppResult<Vec<DuplicateDeal>> {
        let rows = sqlx::query(
            "SELECT d1.id, d1.deal_id, d1.mid FROM deals d1 WHERE d1.mid NOT LIKE '00%' \
             AND EXISTS (SELECT 1 FROM deals d2 WHERE d2.mid = '00' || d1.mid)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list duplicate deals"))?;

        rows.into_iter()
            .map(|row| {
                Ok(DuplicateDeal {
                    id: uuid_column(&row, "id")?,
                    deal_id: column(&row, "deal_id")?,
                    mid: column(&row, "mid")?,
                })
            })
            .collect()
    }

    /// Whether a payout carrying exactly this merchant id exists.
    pub async fn payout_mid_exists(&self, mid: &str) -> AppResult<bool> {
        let found: Option<String> = sqlx::query_scalar("SELECT id FROM payouts WHERE mid = ?1 LIMIT 1")
            .bind(mid)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("failed to check payout sibling"))?;
        Ok(found.is_some())
    }

    pub async fn record_run(&self, version: &str, step: &str, affected: u64) -> AppResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO repair_runs (id, version, step, affected, created_at) VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(id.to_string())
            .bind(version)
            .bind(step)
            .bind(i64::try_from(affected).unwrap_or(i64::MAX))
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to record repair run"))?;
        Ok(id)
    }

    pub async fn runs(&self, version: &str) -> AppResult<Vec<RepairRun>> {
        let rows = sqlx::query(
            "SELECT id, version, step, affected, created_at FROM repair_runs WHERE version = ?1 ORDER BY created_at ASC",
        )
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list repair runs"))?;

        rows.into_iter()
            .map(|row| {
                Ok(RepairRun {
                    id: uuid_column(&row, "id")?,
                    version: column(&row, "version")?,
                    step: column(&row, "step")?,
                    affected: column(&row, "affected")?,
                    created_at: column(&row, "created_at")?,
                })
            })
            .collect()
    }
}

fn parse_participants(raw: &str) -> AppResult<Vec<Participant>> {
    serde_json::from_str::<Value>(raw)
        .map(normalize_list)
        .map_err(|e| AppError::Persistence(format!("invalid participants_json: {e}")))
}
