use chrono::{DateTime, Utc};
use residuals_common::error::{AppError, AppResult};
use residuals_common::types::{ActionRecord, ActionType, EntityType};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::db::{column, db_err, json_column, optional_uuid_column, uuid_column};

const ACTION_COLUMNS: &str = "id, action_type, entity_type, entity_id, entity_name, previous_data, new_data, \
     description, request_id, batch_id, is_undone, undone_at, undo_action_id, created_at";

#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

/// An audit entry waiting to be written. The id is fixed up front so callers
/// can reference the entry before it lands.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
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
    pub created_at: DateTime<Utc>,
}

impl NewAction {
    pub fn new(
        action_type: ActionType,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            entity_type,
            entity_id: entity_id.into(),
            entity_name: None,
            previous_data: None,
            new_data: None,
            description: description.into(),
            request_id: None,
            batch_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn previous(mut self, data: Option<Value>) -> Self {
        self.previous_data = data;
        self
    }

    pub fn new_data(mut self, data: Option<Value>) -> Self {
        self.new_data = data;
        self
    }

    pub fn request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn batch(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub action_type: Option<ActionType>,
    pub request_id: Option<String>,
    pub include_undone: bool,
    pub limit: i64,
    pub offset: i64,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, action: &NewAction) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO action_history (id, action_type, entity_type, entity_id, entity_name, previous_data, new_data, \
             description, request_id, batch_id, is_undone, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
        )
        .bind(action.id.to_string())
        .bind(action.action_type.as_str())
        .bind(action.entity_type.as_str())
        .bind(&action.entity_id)
        .bind(&action.entity_name)
        .bind(action.previous_data.as_ref().map(Value::to_string))
        .bind(action.new_data.as_ref().map(Value::to_string))
        .bind(&action.description)
        .bind(&action.request_id)
        .bind(&action.batch_id)
        .bind(action.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to write action history"))?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> AppResult<Option<ActionRecord>> {
        let row = sqlx::query(&format!("SELECT {ACTION_COLUMNS} FROM action_history WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("failed to fetch action"))?;

        row.map(row_to_action).transpose()
    }

    pub async fn list(&self, filter: &HistoryFilter) -> AppResult<Vec<ActionRecord>> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {ACTION_COLUMNS} FROM action_history WHERE 1 = 1"));
        if let Some(entity_type) = filter.entity_type {
            query.push(" AND entity_type = ").push_bind(entity_type.as_str());
        }
        if let Some(entity_id) = &filter.entity_id {
            query.push(" AND entity_id = ").push_bind(entity_id.clone());
        }
        if let Some(action_type) = filter.action_type {
            query.push(" AND action_type = ").push_bind(action_type.as_str());
        }
        if let Some(request_id) = &filter.request_id {
            query.push(" AND request_id = ").push_bind(request_id.clone());
        }
        if !filter.include_undone {
            query.push(" AND is_undone = 0");
        }
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to list action history"))?;
        rows.into_iter().map(row_to_action).collect()
    }

    /// Flag an entry as undone. Returns 0 when it was already undone.
    pub async fn mark_undone(&self, id: Uuid, undo_action_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE action_history SET is_undone = 1, undone_at = ?1, undo_action_id = ?2 \
             WHERE id = ?3 AND is_undone = 0",
        )
        .bind(Utc::now())
        .bind(undo_action_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to mark action undone"))?;
        Ok(result.rows_affected())
    }
}

fn row_to_action(row: SqliteRow) -> AppResult<ActionRecord> {
    let action_type: String = column(&row, "action_type")?;
    let entity_type: String = column(&row, "entity_type")?;
    let undone_at: Option<DateTime<Utc>> = column(&row, "undone_at")?;
    let created_at: DateTime<Utc> = column(&row, "created_at")?;

    Ok(ActionRecord {
        id: uuid_column(&row, "id")?,
        action_type: action_type
            .parse()
            .map_err(|_| AppError::Persistence(format!("invalid action type: {action_type}")))?,
        entity_type: entity_type
            .parse()
            .map_err(|_| AppError::Persistence(format!("invalid entity type: {entity_type}")))?,
        entity_id: column(&row, "entity_id")?,
        entity_name: column(&row, "entity_name")?,
        previous_data: json_column(&row, "previous_data")?,
        new_data: json_column(&row, "new_data")?,
        description: column(&row, "description")?,
        request_id: column(&row, "request_id")?,
        batch_id: column(&row, "batch_id")?,
        is_undone: column(&row, "is_undone")?,
        undone_at,
        undo_action_id: optional_uuid_column(&row, "undo_action_id")?,
        created_at,
    })
}
