use chrono::{DateTime, Utc};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::{AssignmentStatus, PaidStatus, PayoutRecord};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::{column, db_err, decimal_column, decimal_to_db, optional_uuid_column, uuid_column};
use crate::stores::event::push_id_list;

const PAYOUT_COLUMNS: &str = "id, csv_data_id, deal_id, mid, merchant_name, payout_month, payout_date, payout_type, \
     volume, fees, adjustments, chargebacks, net_residual, partner_airtable_id, partner_name, partner_role, \
     partner_split_pct, partner_payout_amount, assignment_status, paid_status, paid_at, is_legacy_import, \
     created_at, updated_at";

#[derive(Clone)]
pub struct PayoutStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct NewPayout {
    pub csv_data_id: Option<Uuid>,
    pub deal_id: Option<String>,
    pub mid: String,
    pub merchant_name: Option<String>,
    pub payout_month: Option<String>,
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
}

#[derive(Debug, Clone, Default)]
pub struct PayoutFilter {
    pub payout_month: Option<String>,
    pub partner_airtable_id: Option<String>,
    pub paid_status: Option<PaidStatus>,
    pub mid: Option<String>,
    pub assignment_status: Option<AssignmentStatus>,
    pub min_split_pct_exclusive: Option<Decimal>,
}

/// Partner fields copied between duplicate payout rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerFields {
    pub partner_airtable_id: String,
    pub partner_name: Option<String>,
    pub partner_role: String,
    pub partner_split_pct: Decimal,
    pub partner_payout_amount: Decimal,
}

impl PayoutStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, input: NewPayout) -> AppResult<PayoutRecord> {
        let id = Uuid::new_v4();
        insert_row(&self.pool, id, input, Utc::now()).await?;
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payout {id}")))
    }

    /// Flip an event to `status`, mirror it onto the event's existing payouts
    /// and insert `fresh` rows, all in one transaction. Either every row lands
    /// or none do. Returns the new payout ids and the mirrored row count.
    pub async fn settle_event(
        &self,
        event_id: Uuid,
        status: AssignmentStatus,
        fresh: Vec<NewPayout>,
    ) -> AppResult<(Vec<Uuid>, u64)> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err("failed to open transaction"))?;

        sqlx::query("UPDATE events SET assignment_status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now)
            .bind(event_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err("failed to update event status"))?;
        let mirrored = sqlx::query("UPDATE payouts SET assignment_status = ?1, updated_at = ?2 WHERE csv_data_id = ?3")
            .bind(status.as_str())
            .bind(now)
            .bind(event_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err("failed to update payout status"))?
            .rows_affected();

        let mut created = Vec::with_capacity(fresh.len());
        for input in fresh {
            let id = Uuid::new_v4();
            insert_row(&mut *tx, id, input, now).await?;
            created.push(id);
        }

        tx.commit().await.map_err(db_err("failed to commit event settlement"))?;
        Ok((created, mirrored))
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Option<PayoutRecord>> {
        let row = sqlx::query(&format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("failed to fetch payout"))?;

        row.map(row_to_payout).transpose()
    }

    pub async fn get_many(&self, ids: &[Uuid]) -> AppResult<Vec<PayoutRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE id IN ("));
        push_id_list(&mut query, ids);
        query.push(") ORDER BY created_at ASC");
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to fetch payouts"))?;
        rows.into_iter().map(row_to_payout).collect()
    }

    pub async fn list_for_events(&self, event_ids: &[Uuid]) -> AppResult<Vec<PayoutRecord>> {
        if event_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE csv_data_id IN ("));
        push_id_list(&mut query, event_ids);
        query.push(") ORDER BY created_at ASC");
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to list payouts for events"))?;
        rows.into_iter().map(row_to_payout).collect()
    }

    pub async fn list_for_deal_token(&self, deal_token: &str) -> AppResult<Vec<PayoutRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts WHERE deal_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(deal_token)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list payouts for deal"))?;
        rows.into_iter().map(row_to_payout).collect()
    }

    /// One page of payouts, newest first.
    pub async fn list_page(
        &self,
        filter: &PayoutFilter,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<PayoutRecord>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {PAYOUT_COLUMNS} FROM payouts WHERE 1 = 1"));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to list payouts"))?;
        rows.into_iter().map(row_to_payout).collect()
    }

    /// Every matching payout, read page by page.
    pub async fn list_all(&self, filter: &PayoutFilter, page_size: i64) -> AppResult<Vec<PayoutRecord>> {
        let page_size = page_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list_page(filter, page_size, offset).await?;
            let fetched = page.len() as i64;
            out.extend(page);
            if fetched < page_size {
                break;
            }
            offset += page_size;
        }
        Ok(out)
    }

    pub async fn count(&self, filter: &PayoutFilter) -> AppResult<i64> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM payouts WHERE 1 = 1");
        push_filter(&mut query, filter);
        query
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("failed to count payouts"))
    }

    pub async fn delete(&self, id: Uuid) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM payouts WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete payout"))?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for_events(&self, event_ids: &[Uuid]) -> AppResult<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM payouts WHERE csv_data_id IN (");
        push_id_list(&mut query, event_ids);
        query.push(")");
        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete payouts for events"))?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for_deal_token(&self, deal_token: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM payouts WHERE deal_id = ?1")
            .bind(deal_token)
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete payouts for deal"))?;
        Ok(result.rows_affected())
    }

    /// Direct edit. `paid_at` follows the paid status.
    pub async fn update_fields(
        &self,
        id: Uuid,
        split_pct: Option<Decimal>,
        amount: Option<Decimal>,
        paid_status: Option<PaidStatus>,
    ) -> AppResult<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE payouts SET \
             partner_split_pct = COALESCE(?1, partner_split_pct), \
             partner_payout_amount = COALESCE(?2, partner_payout_amount), \
             paid_status = COALESCE(?3, paid_status), \
             paid_at = CASE WHEN ?3 IS NULL THEN paid_at WHEN ?3 = 'paid' THEN COALESCE(paid_at, ?4) ELSE NULL END, \
             updated_at = ?4 WHERE id = ?5",
        )
        .bind(split_pct.map(decimal_to_db))
        .bind(amount.map(decimal_to_db))
        .bind(paid_status.map(PaidStatus::as_str))
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to update payout"))?;
        Ok(result.rows_affected())
    }

    /// Flip every unpaid row for a partner and month to paid in one statement.
    pub async fn mark_paid(&self, partner_airtable_id: &str, payout_month: &str, at: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payouts SET paid_status = 'paid', paid_at = ?1, updated_at = ?1 \
             WHERE partner_airtable_id = ?2 AND payout_month = ?3 AND paid_status = 'unpaid'",
        )
        .bind(at)
        .bind(partner_airtable_id)
        .bind(payout_month)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to mark payouts paid"))?;
        Ok(result.rows_affected())
    }

    pub async fn distinct_months(&self) -> AppResult<Vec<String>> {
        sqlx::query_scalar(
            "SELECT DISTINCT payout_month FROM payouts WHERE payout_month IS NOT NULL ORDER BY payout_month DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("failed to list payout months"))
    }

    pub async fn update_merchant(
        &self,
        old_mid: &str,
        new_mid: &str,
        new_name: Option<&str>,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payouts SET mid = ?1, merchant_name = COALESCE(?2, merchant_name), updated_at = ?3 WHERE mid = ?4",
        )
        .bind(new_mid)
        .bind(new_name)
        .bind(Utc::now())
        .bind(old_mid)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to update payout merchant"))?;
        Ok(result.rows_affected())
    }

    pub async fn set_partner_fields(&self, id: Uuid, fields: &PartnerFields) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE payouts SET partner_airtable_id = ?1, partner_name = ?2, partner_role = ?3, \
             partner_split_pct = ?4, partner_payout_amount = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(&fields.partner_airtable_id)
        .bind(&fields.partner_name)
        .bind(&fields.partner_role)
        .bind(decimal_to_db(fields.partner_split_pct))
        .bind(decimal_to_db(fields.partner_payout_amount))
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to copy payout partner fields"))?;
        Ok(result.rows_affected())
    }

    /// Write a captured row image back, replacing any current row.
    pub async fn restore(&self, payout: &PayoutRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO payouts (id, csv_data_id, deal_id, mid, merchant_name, payout_month, payout_date, \
             payout_type, volume, fees, adjustments, chargebacks, net_residual, partner_airtable_id, partner_name, \
             partner_role, partner_split_pct, partner_payout_amount, assignment_status, paid_status, paid_at, \
             is_legacy_import, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
             ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
        )
        .bind(payout.id.to_string())
        .bind(payout.csv_data_id.map(|v| v.to_string()))
        .bind(&payout.deal_id)
        .bind(&payout.mid)
        .bind(&payout.merchant_name)
        .bind(&payout.payout_month)
        .bind(&payout.payout_date)
        .bind(&payout.payout_type)
        .bind(decimal_to_db(payout.volume))
        .bind(decimal_to_db(payout.fees))
        .bind(decimal_to_db(payout.adjustments))
        .bind(decimal_to_db(payout.chargebacks))
        .bind(decimal_to_db(payout.net_residual))
        .bind(&payout.partner_airtable_id)
        .bind(&payout.partner_name)
        .bind(&payout.partner_role)
        .bind(decimal_to_db(payout.partner_split_pct))
        .bind(decimal_to_db(payout.partner_payout_amount))
        .bind(payout.assignment_status.as_str())
        .bind(payout.paid_status.as_str())
        .bind(payout.paid_at)
        .bind(payout.is_legacy_import)
        .bind(payout.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to restore payout"))?;
        Ok(())
    }
}

async fn insert_row<'e, E>(executor: E, id: Uuid, input: NewPayout, now: DateTime<Utc>) -> AppResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO payouts (id, csv_data_id, deal_id, mid, merchant_name, payout_month, payout_type, volume, fees, \
         adjustments, chargebacks, net_residual, partner_airtable_id, partner_name, partner_role, partner_split_pct, \
         partner_payout_amount, assignment_status, paid_status, is_legacy_import, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, 'unpaid', 0, ?19, ?19)",
    )
    .bind(id.to_string())
    .bind(input.csv_data_id.map(|v| v.to_string()))
    .bind(input.deal_id)
    .bind(input.mid)
    .bind(input.merchant_name)
    .bind(input.payout_month)
    .bind(input.payout_type)
    .bind(decimal_to_db(input.volume))
    .bind(decimal_to_db(input.fees))
    .bind(decimal_to_db(input.adjustments))
    .bind(decimal_to_db(input.chargebacks))
    .bind(decimal_to_db(input.net_residual))
    .bind(input.partner_airtable_id)
    .bind(input.partner_name)
    .bind(input.partner_role)
    .bind(decimal_to_db(input.partner_split_pct))
    .bind(decimal_to_db(input.partner_payout_amount))
    .bind(input.assignment_status.as_str())
    .bind(now)
    .execute(executor)
    .await
    .map_err(db_err("failed to insert payout"))?;
    Ok(())
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &PayoutFilter) {
    if let Some(month) = &filter.payout_month {
        query.push(" AND payout_month = ").push_bind(month.clone());
    }
    if let Some(partner) = &filter.partner_airtable_id {
        query.push(" AND partner_airtable_id = ").push_bind(partner.clone());
    }
    if let Some(status) = filter.paid_status {
        query.push(" AND paid_status = ").push_bind(status.as_str());
    }
    if let Some(mid) = &filter.mid {
        query.push(" AND mid = ").push_bind(mid.clone());
    }
    if let Some(status) = filter.assignment_status {
        query.push(" AND assignment_status = ").push_bind(status.as_str());
    }
    if let Some(min) = filter.min_split_pct_exclusive {
        query
            .push(" AND CAST(partner_split_pct AS REAL) > ")
            .push_bind(min.to_f64().unwrap_or_default());
    }
}

fn row_to_payout(row: SqliteRow) -> AppResult<PayoutRecord> {
    let assignment_status: String = column(&row, "assignment_status")?;
    let paid_status: String = column(&row, "paid_status")?;
    let paid_at: Option<DateTime<Utc>> = column(&row, "paid_at")?;
    let created_at: DateTime<Utc> = column(&row, "created_at")?;
    let updated_at: DateTime<Utc> = column(&row, "updated_at")?;

    Ok(PayoutRecord {
        id: uuid_column(&row, "id")?,
        csv_data_id: optional_uuid_column(&row, "csv_data_id")?,
        deal_id: column(&row, "deal_id")?,
        mid: column(&row, "mid")?,
        merchant_name: column(&row, "merchant_name")?,
        payout_month: column(&row, "payout_month")?,
        payout_date: column(&row, "payout_date")?,
        payout_type: column(&row, "payout_type")?,
        volume: decimal_column(&row, "volume")?,
        fees: decimal_column(&row, "fees")?,
        adjustments: decimal_column(&row, "adjustments")?,
        chargebacks: decimal_column(&row, "chargebacks")?,
        net_residual: decimal_column(&row, "net_residual")?,
        partner_airtable_id: column(&row, "partner_airtable_id")?,
        partner_name: column(&row, "partner_name")?,
        partner_role: column(&row, "partner_role")?,
        partner_split_pct: decimal_column(&row, "partner_split_pct")?,
        partner_payout_amount: decimal_column(&row, "partner_payout_amount")?,
        assignment_status: assignment_status.parse().map_err(|_| {
            AppError::Persistence(format!("invalid payout status: {assignment_status}"))
        })?,
        paid_status: paid_status
            .parse()
            .map_err(|_| AppError::Persistence(format!("invalid paid status: {paid_status}")))?,
        paid_at,
        is_legacy_import: column(&row, "is_legacy_import")?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use residuals_common::types::{AssignmentStatus, PaidStatus};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{NewPayout, PayoutFilter, PayoutStore};
    use crate::db::memory_pool;

    fn new_payout(partner: &str, month: &str, pct: i64) -> NewPayout {
        NewPayout {
            csv_data_id: Some(Uuid::new_v4()),
            deal_id: Some("deal_x".to_string()),
            mid: "111".to_string(),
            merchant_name: None,
            payout_month: Some(month.to_string()),
            payout_type: "residual".to_string(),
            volume: Decimal::ZERO,
            fees: Decimal::new(1000, 0),
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            net_residual: Decimal::new(1000, 0),
            partner_airtable_id: partner.to_string(),
            partner_name: Some(partner.to_string()),
            partner_role: "Agent".to_string(),
            partner_split_pct: Decimal::new(pct, 0),
            partner_payout_amount: Decimal::new(pct * 10, 0),
            assignment_status: AssignmentStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn mark_paid_only_touches_unpaid_rows_for_partner_and_month() {
        let store = PayoutStore::new(memory_pool().await.expect("pool"));
        store.insert(new_payout("a", "2024-01", 50)).await.expect("insert");
        store.insert(new_payout("a", "2024-01", 25)).await.expect("insert");
        store.insert(new_payout("a", "2024-02", 25)).await.expect("insert");
        store.insert(new_payout("b", "2024-01", 25)).await.expect("insert");

        let updated = store.mark_paid("a", "2024-01", Utc::now()).await.expect("mark");
        assert_eq!(updated, 2);
        let again = store.mark_paid("a", "2024-01", Utc::now()).await.expect("mark");
        assert_eq!(again, 0);

        let paid = store
            .count(&PayoutFilter {
                paid_status: Some(PaidStatus::Paid),
                ..PayoutFilter::default()
            })
            .await
            .expect("count");
        assert_eq!(paid, 2);
    }

    #[tokio::test]
    async fn list_all_pages_past_page_size() {
        let store = PayoutStore::new(memory_pool().await.expect("pool"));
        for _ in 0..7 {
            store.insert(new_payout("a", "2024-01", 10)).await.expect("insert");
        }
        let all = store.list_all(&PayoutFilter::default(), 3).await.expect("list");
        assert_eq!(all.len(), 7);
    }

    #[tokio::test]
    async fn direct_edit_sets_and_clears_paid_at() {
        let store = PayoutStore::new(memory_pool().await.expect("pool"));
        let payout = store.insert(new_payout("a", "2024-01", 10)).await.expect("insert");

        store
            .update_fields(payout.id, Some(Decimal::new(15, 0)), None, Some(PaidStatus::Paid))
            .await
            .expect("update");
        let edited = store.get(payout.id).await.expect("get").expect("exists");
        assert_eq!(edited.partner_split_pct, Decimal::new(15, 0));
        assert_eq!(edited.partner_payout_amount, Decimal::new(100, 0));
        assert!(edited.paid_at.is_some());

        store
            .update_fields(payout.id, None, None, Some(PaidStatus::Unpaid))
            .await
            .expect("update");
        let edited = store.get(payout.id).await.expect("get").expect("exists");
        assert_eq!(edited.paid_status, PaidStatus::Unpaid);
        assert!(edited.paid_at.is_none());
    }

    #[tokio::test]
    async fn split_filter_excludes_zero_percent_rows() {
        let store = PayoutStore::new(memory_pool().await.expect("pool"));
        store.insert(new_payout("a", "2024-01", 0)).await.expect("insert");
        store.insert(new_payout("b", "2024-01", 10)).await.expect("insert");

        let rows = store
            .list_all(
                &PayoutFilter {
                    min_split_pct_exclusive: Some(Decimal::ZERO),
                    ..PayoutFilter::default()
                },
                100,
            )
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].partner_airtable_id, "b");
    }
}
