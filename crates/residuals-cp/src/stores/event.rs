use chrono::{DateTime, Utc};
use residuals_common::api::{BatchSummary, EventStats, StatusStats};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::{AssignmentStatus, EventRecord};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::{
    column, db_err, decimal_column, decimal_to_db, json_column, optional_uuid_column, uuid_column,
};

const EVENT_COLUMNS: &str = "id, row_hash, batch_id, mid, merchant_name, volume, fees, adjustments, chargebacks, \
     date, payout_month, payout_type, assignment_status, deal_id, assigned_agent_id, assigned_agent_name, \
     is_held, hold_reason, raw_data, created_at, updated_at";

#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
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
    pub raw_data: Option<Value>,
}

/// Filter for [`EventStore::list`]. `statuses` empty means any status.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub statuses: Vec<AssignmentStatus>,
    pub batch_id: Option<String>,
    pub payout_month: Option<String>,
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct AssignmentUpdate {
    pub deal_id: Uuid,
    pub assigned_agent_id: Option<String>,
    pub assigned_agent_name: Option<String>,
    pub payout_type: String,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert unless an event with the same row hash exists. Returns the new
    /// id, or `None` for a duplicate row.
    pub async fn insert_if_new(&self, input: NewEvent) -> AppResult<Option<Uuid>> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let raw_data = input.raw_data.map(|v| v.to_string());
        let result = sqlx::query(
            "INSERT INTO events (id, row_hash, batch_id, mid, merchant_name, volume, fees, adjustments, chargebacks, \
             date, payout_month, payout_type, assignment_status, raw_data, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'unassigned', ?13, ?14, ?14) \
             ON CONFLICT(row_hash) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(input.row_hash)
        .bind(input.batch_id)
        .bind(input.mid)
        .bind(input.merchant_name)
        .bind(decimal_to_db(input.volume))
        .bind(decimal_to_db(input.fees))
        .bind(decimal_to_db(input.adjustments))
        .bind(decimal_to_db(input.chargebacks))
        .bind(input.date)
        .bind(input.payout_month)
        .bind(input.payout_type)
        .bind(raw_data)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to insert event"))?;

        Ok((result.rows_affected() == 1).then_some(id))
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Option<EventRecord>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("failed to fetch event"))?;

        row.map(row_to_event).transpose()
    }

    /// Events for the given ids in request order. Unknown ids are skipped.
    pub async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<EventRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = self.get(*id).await? {
                out.push(event);
            }
        }
        Ok(out)
    }

    pub async fn list(&self, filter: &EventFilter) -> AppResult<(Vec<EventRecord>, i64)> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM events WHERE 1 = 1");
        push_filter(&mut count, filter);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("failed to count events"))?;

        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1 = 1"));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, mid ASC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to list events"))?;

        let events = rows.into_iter().map(row_to_event).collect::<AppResult<Vec<_>>>()?;
        Ok((events, total))
    }

    pub async fn list_by_deal(&self, deal_id: Uuid) -> AppResult<Vec<EventRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE deal_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(deal_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list events for deal"))?;

        rows.into_iter().map(row_to_event).collect()
    }

    /// Point the given events at a deal and move them to `pending`.
    pub async fn assign(&self, ids: &[Uuid], update: &AssignmentUpdate) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE events SET assignment_status = 'pending', deal_id = ");
        query
            .push_bind(update.deal_id.to_string())
            .push(", assigned_agent_id = ")
            .push_bind(update.assigned_agent_id.clone())
            .push(", assigned_agent_name = ")
            .push_bind(update.assigned_agent_name.clone())
            .push(", payout_type = ")
            .push_bind(update.payout_type.clone())
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE id IN (");
        push_id_list(&mut query, ids);
        query.push(")");

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to assign events"))?;
        Ok(result.rows_affected())
    }

    pub async fn set_status(&self, id: Uuid, status: AssignmentStatus) -> AppResult<u64> {
        let result = sqlx::query("UPDATE events SET assignment_status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update event status"))?;
        Ok(result.rows_affected())
    }

    /// Back to `unassigned` with the deal reference and assignee cleared.
    pub async fn reset(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE events SET assignment_status = 'unassigned', deal_id = NULL, assigned_agent_id = NULL, \
             assigned_agent_name = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to reset event"))?;
        Ok(result.rows_affected())
    }

    pub async fn reset_by_deal(&self, deal_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE events SET assignment_status = 'unassigned', deal_id = NULL, assigned_agent_id = NULL, \
             assigned_agent_name = NULL, updated_at = ?1 WHERE deal_id = ?2",
        )
        .bind(Utc::now())
        .bind(deal_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to reset events for deal"))?;
        Ok(result.rows_affected())
    }

    pub async fn set_hold(&self, ids: &[Uuid], held: bool, reason: Option<&str>) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE events SET is_held = ");
        query
            .push_bind(held)
            .push(", hold_reason = ")
            .push_bind(if held { reason.map(ToString::to_string) } else { None })
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE id IN (");
        push_id_list(&mut query, ids);
        query.push(")");

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update event hold"))?;
        Ok(result.rows_affected())
    }

    pub async fn set_payout_month(&self, ids: &[Uuid], payout_month: &str) -> AppResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("UPDATE events SET payout_month = ");
        query
            .push_bind(payout_month.to_string())
            .push(", updated_at = ")
            .push_bind(Utc::now())
            .push(" WHERE id IN (");
        push_id_list(&mut query, ids);
        query.push(")");

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to update payout month"))?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete event"))?;
        Ok(result.rows_affected())
    }

    pub async fn delete_if_unassigned(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?1 AND assignment_status = 'unassigned'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete event"))?;
        Ok(result.rows_affected())
    }

    /// Write a captured row image back, replacing any current row.
    pub async fn restore(&self, event: &EventRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO events (id, row_hash, batch_id, mid, merchant_name, volume, fees, adjustments, \
             chargebacks, date, payout_month, payout_type, assignment_status, deal_id, assigned_agent_id, \
             assigned_agent_name, is_held, hold_reason, raw_data, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
        )
        .bind(event.id.to_string())
        .bind(&event.row_hash)
        .bind(&event.batch_id)
        .bind(&event.mid)
        .bind(&event.merchant_name)
        .bind(decimal_to_db(event.volume))
        .bind(decimal_to_db(event.fees))
        .bind(decimal_to_db(event.adjustments))
        .bind(decimal_to_db(event.chargebacks))
        .bind(&event.date)
        .bind(&event.payout_month)
        .bind(&event.payout_type)
        .bind(event.assignment_status.as_str())
        .bind(event.deal_id.map(|id| id.to_string()))
        .bind(&event.assigned_agent_id)
        .bind(&event.assigned_agent_name)
        .bind(event.is_held)
        .bind(&event.hold_reason)
        .bind(event.raw_data.as_ref().map(|v| v.to_string()))
        .bind(event.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to restore event"))?;
        Ok(())
    }

    pub async fn stats(&self) -> AppResult<EventStats> {
        let rows = sqlx::query("SELECT assignment_status, volume, fees FROM events")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to load event stats"))?;

        let mut stats = EventStats::default();
        for row in rows {
            let raw: String = column(&row, "assignment_status")?;
            let bucket: &mut StatusStats = match raw.parse::<AssignmentStatus>()? {
                AssignmentStatus::Unassigned => &mut stats.unassigned,
                AssignmentStatus::Pending | AssignmentStatus::PendingConfirmation => &mut stats.pending,
                AssignmentStatus::Confirmed => &mut stats.confirmed,
            };
            bucket.count += 1;
            bucket.volume += decimal_column(&row, "volume")?;
            bucket.fees += decimal_column(&row, "fees")?;
        }
        Ok(stats)
    }

    pub async fn batches(&self) -> AppResult<Vec<BatchSummary>> {
        let rows = sqlx::query(
            "SELECT batch_id, MAX(payout_month) AS payout_month, COUNT(*) AS total_rows, \
             SUM(CASE WHEN assignment_status = 'unassigned' THEN 1 ELSE 0 END) AS unassigned_rows, \
             MIN(created_at) AS imported_at \
             FROM events GROUP BY batch_id ORDER BY imported_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list batches"))?;

        rows.into_iter()
            .map(|row| {
                Ok(BatchSummary {
                    batch_id: column(&row, "batch_id")?,
                    payout_month: column(&row, "payout_month")?,
                    total_rows: column(&row, "total_rows")?,
                    unassigned_rows: column(&row, "unassigned_rows")?,
                    imported_at: column(&row, "imported_at")?,
                })
            })
            .collect()
    }

    pub async fn update_merchant(
        &self,
        old_mid: &str,
        new_mid: &str,
        new_name: Option<&str>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE events SET mid = ?1, merchant_name = COALESCE(?2, merchant_name), updated_at = ?3 WHERE mid = ?4",
        )
        .bind(new_mid)
        .bind(new_name)
        .bind(Utc::now())
        .bind(old_mid)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to update event merchant"))?;
        Ok(result.rows_affected())
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &EventFilter) {
    if !filter.statuses.is_empty() {
        query.push(" AND assignment_status IN (");
        let mut separated = query.separated(", ");
        for status in &filter.statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(batch_id) = &filter.batch_id {
        query.push(" AND batch_id = ").push_bind(batch_id.clone());
    }
    if let Some(month) = &filter.payout_month {
        query.push(" AND payout_month = ").push_bind(month.clone());
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", search.trim());
        query
            .push(" AND (mid LIKE ")
            .push_bind(pattern.clone())
            .push(" OR merchant_name LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

pub(crate) fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[Uuid]) {
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
}

fn row_to_event(row: SqliteRow) -> AppResult<EventRecord> {
    let status: String = column(&row, "assignment_status")?;
    let created_at: DateTime<Utc> = column(&row, "created_at")?;
    let updated_at: DateTime<Utc> = column(&row, "updated_at")?;

    Ok(EventRecord {
        id: uuid_column(&row, "id")?,
        row_hash: column(&row, "row_hash")?,
        batch_id: column(&row, "batch_id")?,
        mid: column(&row, "mid")?,
        merchant_name: column(&row, "merchant_name")?,
        volume: decimal_column(&row, "volume")?,
        fees: decimal_column(&row, "fees")?,
        adjustments: decimal_column(&row, "adjustments")?,
        chargebacks: decimal_column(&row, "chargebacks")?,
        date: column(&row, "date")?,
        payout_month: column(&row, "payout_month")?,
        payout_type: column(&row, "payout_type")?,
        assignment_status: status
            .parse()
            .map_err(|_| AppError::Persistence(format!("invalid event status: {status}")))?,
        deal_id: optional_uuid_column(&row, "deal_id")?,
        assigned_agent_id: column(&row, "assigned_agent_id")?,
        assigned_agent_name: column(&row, "assigned_agent_name")?,
        is_held: column(&row, "is_held")?,
        hold_reason: column(&row, "hold_reason")?,
        raw_data: json_column(&row, "raw_data")?,
        created_at,
        updated_at,
    })
}
