use std::str::FromStr;

use residuals_common::error::{AppError, AppResult};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

pub async fn connect_and_migrate(database_url: &str) -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|e| AppError::Persistence(format!("sqlite connect failed: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Persistence(format!("sqlite migrate failed: {e}")))?;

    Ok(pool)
}

/// In-memory database for tests. A single connection keeps every query on
/// the same memory database.
pub async fn memory_pool() -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| AppError::Persistence(format!("sqlite connect failed: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| AppError::Persistence(format!("sqlite migrate failed: {e}")))?;

    Ok(pool)
}

/// Amounts are stored as normalized decimal text so equal values compare
/// equal in SQL.
pub(crate) fn decimal_to_db(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn decimal_from_db(column: &str, raw: &str) -> AppResult<Decimal> {
    Decimal::from_str(raw.trim())
        .or_else(|_| Decimal::from_scientific(raw.trim()))
        .map_err(|e| AppError::Persistence(format!("invalid decimal in {column}: {e}")))
}

pub(crate) fn db_err(context: &str) -> impl FnOnce(sqlx::Error) -> AppError + '_ {
    move |e| AppError::Persistence(format!("{context}: {e}"))
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> AppResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get::<T, &str>(name)
        .map_err(|e| AppError::Persistence(format!("read {name} failed: {e}")))
}

pub(crate) fn uuid_column(row: &SqliteRow, name: &str) -> AppResult<Uuid> {
    let raw: String = column(row, name)?;
    Uuid::parse_str(&raw).map_err(|e| AppError::Persistence(format!("invalid {name} uuid: {e}")))
}

pub(crate) fn optional_uuid_column(row: &SqliteRow, name: &str) -> AppResult<Option<Uuid>> {
    let raw: Option<String> = column(row, name)?;
    raw.filter(|v| !v.is_empty())
        .map(|v| {
            Uuid::parse_str(&v)
                .map_err(|e| AppError::Persistence(format!("invalid {name} uuid: {e}")))
        })
        .transpose()
}

pub(crate) fn decimal_column(row: &SqliteRow, name: &str) -> AppResult<Decimal> {
    let raw: String = column(row, name)?;
    decimal_from_db(name, &raw)
}

pub(crate) fn json_column(row: &SqliteRow, name: &str) -> AppResult<Option<Value>> {
    let raw: Option<String> = column(row, name)?;
    raw.map(|v| {
        serde_json::from_str(&v)
            .map_err(|e| AppError::Persistence(format!("invalid json in {name}: {e}")))
    })
    .transpose()
}
