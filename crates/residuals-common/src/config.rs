use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use crate::error::{AppError, AppResult};

pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub airtable: Option<AirtableSettings>,
    pub sync_batch_size: usize,
    pub sync_batch_delay_ms: u64,
    pub local_page_size: i64,
    pub block_held_confirm: bool,
}

/// Credentials and table coordinates for the external payout mirror.
/// Base and table ids may be overridden at runtime through the settings table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AirtableSettings {
    pub api_key: String,
    pub api_url: String,
    pub base_id: Option<String>,
    pub table_id: Option<String>,
}

impl CpConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_map(&env_map())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> AppResult<Self> {
        let sync_batch_size: usize = parsed(vars, "RESIDUALS_SYNC_BATCH_SIZE", 10)?;
        if sync_batch_size == 0 {
            return Err(AppError::Config(
                "RESIDUALS_SYNC_BATCH_SIZE must be at least 1".to_string(),
            ));
        }
        let local_page_size: i64 = parsed(vars, "RESIDUALS_LOCAL_PAGE_SIZE", 1000)?;
        if local_page_size <= 0 {
            return Err(AppError::Config(
                "RESIDUALS_LOCAL_PAGE_SIZE must be positive".to_string(),
            ));
        }

        let airtable = optional(vars, "AIRTABLE_API_KEY").map(|api_key| AirtableSettings {
            api_key,
            api_url: get(vars, "AIRTABLE_API_URL", DEFAULT_AIRTABLE_API_URL),
            base_id: optional(vars, "AIRTABLE_BASE_ID"),
            table_id: optional(vars, "AIRTABLE_TABLE_ID"),
        });

        Ok(Self {
            bind_addr: get(vars, "RESIDUALS_BIND_ADDR", "0.0.0.0:8080"),
            database_url: get(vars, "RESIDUALS_DATABASE_URL", "sqlite://residuals.db?mode=rwc"),
            airtable,
            sync_batch_size,
            sync_batch_delay_ms: parsed(vars, "RESIDUALS_SYNC_BATCH_DELAY_MS", 220)?,
            local_page_size,
            block_held_confirm: flag(vars, "RESIDUALS_BLOCK_HELD_CONFIRM", false)?,
        })
    }
}

fn env_map() -> HashMap<String, String> {
    env::vars().collect()
}

fn get(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key)
        .cloned()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(vars: &HashMap<String, String>, key: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(vars, key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("invalid {key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn flag(vars: &HashMap<String, String>, key: &str, default: bool) -> AppResult<bool> {
    match optional(vars, key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(AppError::Config(format!("invalid {key}={v}: expected a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{CpConfig, DEFAULT_AIRTABLE_API_URL};

    #[test]
    fn cp_config_defaults_apply() {
        let vars = HashMap::new();
        let cfg = CpConfig::from_map(&vars).expect("cp config");

        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.database_url, "sqlite://residuals.db?mode=rwc");
        assert_eq!(cfg.sync_batch_size, 10);
        assert_eq!(cfg.sync_batch_delay_ms, 220);
        assert_eq!(cfg.local_page_size, 1000);
        assert!(!cfg.block_held_confirm);
        assert!(cfg.airtable.is_none());
    }

    #[test]
    fn airtable_settings_require_api_key() {
        let mut vars = HashMap::new();
        vars.insert("AIRTABLE_BASE_ID".into(), "appBase".into());
        let cfg = CpConfig::from_map(&vars).expect("cp config");
        assert!(cfg.airtable.is_none());

        vars.insert("AIRTABLE_API_KEY".into(), "pat-123".into());
        let cfg = CpConfig::from_map(&vars).expect("cp config");
        let airtable = cfg.airtable.expect("airtable configured");
        assert_eq!(airtable.api_key, "pat-123");
        assert_eq!(airtable.api_url, DEFAULT_AIRTABLE_API_URL);
        assert_eq!(airtable.base_id.as_deref(), Some("appBase"));
        assert!(airtable.table_id.is_none());
    }

    #[test]
    fn rejects_bad_numbers_and_flags() {
        let mut vars = HashMap::new();
        vars.insert("RESIDUALS_SYNC_BATCH_SIZE".into(), "ten".into());
        let err = CpConfig::from_map(&vars).expect_err("bad batch size");
        assert!(err.to_string().contains("RESIDUALS_SYNC_BATCH_SIZE"));

        let mut vars = HashMap::new();
        vars.insert("RESIDUALS_BLOCK_HELD_CONFIRM".into(), "maybe".into());
        let err = CpConfig::from_map(&vars).expect_err("bad flag");
        assert!(err.to_string().contains("RESIDUALS_BLOCK_HELD_CONFIRM"));

        vars.insert("RESIDUALS_BLOCK_HELD_CONFIRM".into(), "TRUE".into());
        let cfg = CpConfig::from_map(&vars).expect("cp config");
        assert!(cfg.block_held_confirm);
    }
}
