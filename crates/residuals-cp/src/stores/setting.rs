use std::collections::HashMap;
use std::env;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use residuals_common::error::{AppError, AppResult};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::{column, db_err};

pub const AIRTABLE_BASE_ID: &str = "airtable.base_id";
pub const AIRTABLE_TABLE_ID: &str = "airtable.table_id";

/// Operator overrides stored in SQLite. Resolution order is database, then
/// environment, then built-in default.
#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
    ttl: Duration,
    cache: Arc<RwLock<Option<CachedSettings>>>,
}

#[derive(Clone)]
struct CachedSettings {
    loaded_at: Instant,
    by_key: HashMap<String, Value>,
}

impl SettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self::new_with_ttl(pool, Duration::from_secs(5))
    }

    pub fn new_with_ttl(pool: SqlitePool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn get(&self, key: &str) -> AppResult<Value> {
        let db_values = self.cached_db_values().await?;
        resolve_value(key, &db_values, &|env_key| env::var(env_key).ok())
            .ok_or_else(|| AppError::NotFound(format!("setting {key}")))
    }

    /// String form of a setting, `None` when unset or blank.
    pub async fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        match self.get(key).await {
            Ok(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Ok(Value::Number(n)) => Ok(Some(n.to_string())),
            Ok(_) | Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&self, key: &str, value: &Value, is_secret: bool) -> AppResult<()> {
        let value_text = serde_json::to_string(value)
            .map_err(|e| AppError::InvalidInput(format!("setting value serialize failed: {e}")))?;

        sqlx::query(
            "INSERT INTO settings (key, value, is_secret, updated_at) \
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, is_secret = excluded.is_secret, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value_text)
        .bind(is_secret)
        .execute(&self.pool)
        .await
        .map_err(db_err("failed to write setting"))?;

        self.invalidate_cache();
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err("failed to delete setting"))?;

        self.invalidate_cache();
        Ok(())
    }

    fn invalidate_cache(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn cached_db_values(&self) -> AppResult<HashMap<String, Value>> {
        if let Some(snapshot) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(snapshot.by_key.clone());
            }
        }

        let values = self.load_all_db_values().await?;
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedSettings {
            loaded_at: Instant::now(),
            by_key: values.clone(),
        });
        Ok(values)
    }

    async fn load_all_db_values(&self) -> AppResult<HashMap<String, Value>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("failed to load settings"))?;

        let mut by_key = HashMap::new();
        for row in rows {
            let key: String = column(&row, "key")?;
            let raw_value: String = column(&row, "value")?;
            let parsed =
                serde_json::from_str::<Value>(&raw_value).unwrap_or(Value::String(raw_value));
            by_key.insert(key, parsed);
        }

        Ok(by_key)
    }
}

fn resolve_value<F>(key: &str, db_values: &HashMap<String, Value>, env_get: &F) -> Option<Value>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = db_values.get(key) {
        return Some(v.clone());
    }

    if let Some(env_key) = env_key_for(key) {
        if let Some(raw) = env_get(env_key).filter(|raw| !raw.trim().is_empty()) {
            if let Ok(v) = serde_json::from_str::<Value>(&raw) {
                return Some(v);
            }
            return Some(Value::String(raw));
        }
    }

    None
}

fn env_key_for(key: &str) -> Option<&'static str> {
    match key {
        AIRTABLE_BASE_ID => Some("AIRTABLE_BASE_ID"),
        AIRTABLE_TABLE_ID => Some("AIRTABLE_TABLE_ID"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::{resolve_value, SettingsStore, AIRTABLE_TABLE_ID};
    use crate::db::memory_pool;

    #[test]
    fn resolves_env_when_db_missing() {
        let db_values = HashMap::new();
        let resolved = resolve_value(AIRTABLE_TABLE_ID, &db_values, &|k| {
            if k == "AIRTABLE_TABLE_ID" {
                Some("tblEnv".to_string())
            } else {
                None
            }
        });
        assert_eq!(resolved, Some(Value::String("tblEnv".to_string())));
    }

    #[test]
    fn resolves_db_over_env() {
        let mut db_values = HashMap::new();
        db_values.insert(AIRTABLE_TABLE_ID.to_string(), json!("tblDb"));

        let resolved = resolve_value(AIRTABLE_TABLE_ID, &db_values, &|_| Some("tblEnv".to_string()));
        assert_eq!(resolved, Some(json!("tblDb")));
    }

    #[test]
    fn unknown_keys_have_no_default() {
        assert_eq!(resolve_value("nope", &HashMap::new(), &|_| None), None);
    }

    #[tokio::test]
    async fn cache_is_invalidated_on_write() {
        let store = SettingsStore::new_with_ttl(memory_pool().await.expect("pool"), Duration::from_secs(60));

        store.put("custom.key", &json!("one"), false).await.expect("put");
        assert_eq!(store.get_string("custom.key").await.expect("get").as_deref(), Some("one"));

        store.put("custom.key", &json!("two"), false).await.expect("put");
        assert_eq!(store.get_string("custom.key").await.expect("get").as_deref(), Some("two"));

        store.delete("custom.key").await.expect("delete");
        assert_eq!(store.get_string("custom.key").await.expect("get"), None);
    }
}
