use chrono::{DateTime, Utc};
use residuals_common::error::{AppError, AppResult};
use residuals_common::participant::{normalize_list, Participant};
use residuals_common::types::DealRecord;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::{column, db_err, uuid_column};

const DEAL_COLUMNS: &str = "id, deal_id, mid, participants_json, payout_type, assigned_agent_name, \
     available_to_purchase, created_at, updated_at";

#[derive(Clone)]
pub struct DealStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct NewDeal {
    pub deal_id: String,
    pub mid: String,
    pub participants: Vec<Participant>,
    pub payout_type: String,
    pub assigned_agent_name: Option<String>,
}

impl DealStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, input: NewDeal) -> AppResult<DealRecord> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO deals (id, deal_id, mid, participants_json, payout_type, assigned_agent_name, \
             available_to_purchase, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
        )
        .bind(id.to_string())
        .bind(&input.deal_id)
        .bind(&input.mid)
        .bind(participants_to_db(&input.participants)?)
        .bind(&input.payout_type)
        .bind(&input.assigned_agent_name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to create deal"))?;

        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("deal {id}")))
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Option<DealRecord>> {
        let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("failed to fetch deal"))?;

        row.map(row_to_deal).transpose()
    }

    /// The current deal for a merchant. Lookup keys on `mid` alone.
    pub async fn find_by_mid(&self, mid: &str) -> AppResult<Option<DealRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEAL_COLUMNS} FROM deals WHERE mid = ?1 ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(mid)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("failed to fetch deal by mid"))?;

        row.map(row_to_deal).transpose()
    }

    pub async fn update_assignment(
        &self,
        id: Uuid,
        participants: &[Participant],
        payout_type: &str,
        assigned_agent_name: Option<&str>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE deals SET participants_json = ?1, payout_type = ?2, assigned_agent_name = ?3, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(participants_to_db(participants)?)
        .bind(payout_type)
        .bind(assigned_agent_name)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to update deal"))?;
        Ok(result.rows_affected())
    }

    /// Replace only the participant list.
    pub async fn set_participants(&self, id: Uuid, participants: &[Participant]) -> AppResult<u64> {
        let result = sqlx::query("UPDATE deals SET participants_json = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(participants_to_db(participants)?)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update deal participants"))?;
        Ok(result.rows_affected())
    }

    pub async fn set_available_to_purchase(&self, id: Uuid, available: bool) -> AppResult<u64> {
        let result = sqlx::query("UPDATE deals SET available_to_purchase = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(available)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update deal"))?;
        Ok(result.rows_affected())
    }

    pub async fn list(
        &self,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<(Vec<DealRecord>, i64)> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM deals WHERE 1 = 1");
        push_search(&mut count, pattern.as_deref());
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("failed to count deals"))?;

        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {DEAL_COLUMNS} FROM deals WHERE 1 = 1"));
        push_search(&mut query, pattern.as_deref());
        query
            .push(" ORDER BY updated_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to list deals"))?;

        let deals = rows.into_iter().map(row_to_deal).collect::<AppResult<Vec<_>>>()?;
        Ok((deals, total))
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM deals WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete deal"))?;
        Ok(result.rows_affected())
    }

    /// Write a captured row image back, replacing any current row.
    pub async fn restore(&self, deal: &DealRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO deals (id, deal_id, mid, participants_json, payout_type, assigned_agent_name, \
             available_to_purchase, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(deal.id.to_string())
        .bind(&deal.deal_id)
        .bind(&deal.mid)
        .bind(participants_to_db(&deal.participants)?)
        .bind(&deal.payout_type)
        .bind(&deal.assigned_agent_name)
        .bind(deal.available_to_purchase)
        .bind(deal.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to restore deal"))?;
        Ok(())
    }

    pub async fn update_merchant(&self, old_mid: &str, new_mid: &str) -> AppResult<u64> {
        let result = sqlx::query("UPDATE deals SET mid = ?1, updated_at = ?2 WHERE mid = ?3")
            .bind(new_mid)
            .bind(Utc::now())
            .bind(old_mid)
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update deal merchant"))?;
        Ok(result.rows_affected())
    }
}

fn push_search(query: &mut QueryBuilder<'_, Sqlite>, pattern: Option<&str>) {
    let Some(pattern) = pattern else {
        return;
    };
    query
        .push(" AND (mid LIKE ")
        .push_bind(pattern.to_string())
        .push(" OR deal_id LIKE ")
        .push_bind(pattern.to_string())
        .push(" OR assigned_agent_name LIKE ")
        .push_bind(pattern.to_string())
        .push(" OR participants_json LIKE ")
        .push_bind(pattern.to_string())
        .push(")");
}

pub(crate) fn participants_to_db(participants: &[Participant]) -> AppResult<String> {
    serde_json::to_string(participants)
        .map_err(|e| AppError::InvalidInput(format!("participants serialize failed: {e}")))
}

fn row_to_deal(row: SqliteRow) -> AppResult<DealRecord> {
    let participants_raw: String = column(&row, "participants_json")?;
    let participants = serde_json::from_str::<Value>(&participants_raw)
        .map(normalize_list)
        .map_err(|e| AppError::Persistence(format!("invalid participants_json: {e}")))?;
    let created_at: DateTime<Utc> = column(&row, "created_at")?;
    let updated_at: DateTime<Utc> = column(&row, "updated_at")?;

    Ok(DealRecord {
        id: uuid_column(&row, "id")?,
        deal_id: column(&row, "deal_id")?,
        mid: column(&row, "mid")?,
        participants,
        payout_type: column(&row, "payout_type")?,
        assigned_agent_name: column(&row, "assigned_agent_name")?,
        available_to_purchase: column(&row, "available_to_purchase")?,
        created_at,
        updated_at,
    })
}
