use async_trait::async_trait;
use chrono::SecondsFormat;
use residuals_common::config::AirtableSettings;
use residuals_common::error::{AppError, AppResult};
use residuals_common::http::build_client;
use residuals_common::types::{PayoutRecord, DEFAULT_PAYOUT_TYPE};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::stores::setting::{SettingsStore, AIRTABLE_BASE_ID, AIRTABLE_TABLE_ID};

pub const PAYOUT_ID_FIELD: &str = "Payout ID";
const PAGE_SIZE: &str = "100";

/// The fields compared when deciding whether a mirrored record is stale.
pub const COMPARED_FIELDS: [&str; 7] = [
    "Paid Status",
    "Paid At",
    "Status",
    "Split %",
    "Payout Amount",
    "Partner Role",
    "Partner Name",
];

/// A payout as the external table stores it. This is the only place local
/// payout fields are mapped to external column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutFields {
    #[serde(rename = "Payout ID")]
    pub payout_id: String,
    #[serde(rename = "Deal ID")]
    pub deal_id: Option<String>,
    #[serde(rename = "MID")]
    pub mid: String,
    #[serde(rename = "Merchant Name")]
    pub merchant_name: Option<String>,
    #[serde(rename = "Payout Month")]
    pub payout_month: Option<String>,
    #[serde(rename = "Payout Date")]
    pub payout_date: Option<String>,
    #[serde(rename = "Partner ID")]
    pub partner_id: String,
    #[serde(rename = "Partner Name")]
    pub partner_name: Option<String>,
    #[serde(rename = "Partner Role")]
    pub partner_role: String,
    #[serde(rename = "Split %")]
    pub split_pct: f64,
    #[serde(rename = "Payout Amount")]
    pub payout_amount: f64,
    #[serde(rename = "Volume")]
    pub volume: f64,
    #[serde(rename = "Fees")]
    pub fees: f64,
    #[serde(rename = "Net Residual")]
    pub net_residual: f64,
    #[serde(rename = "Payout Type")]
    pub payout_type: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Paid Status")]
    pub paid_status: String,
    #[serde(rename = "Paid At")]
    pub paid_at: Option<String>,
    #[serde(rename = "Is Legacy")]
    pub is_legacy: String,
}

impl PayoutFields {
    pub fn from_payout(payout: &PayoutRecord) -> Self {
        let payout_type = if payout.payout_type.trim().is_empty() {
            DEFAULT_PAYOUT_TYPE.to_string()
        } else {
            payout.payout_type.clone()
        };
        Self {
            payout_id: payout.id.to_string(),
            deal_id: payout.deal_id.clone(),
            mid: payout.mid.clone(),
            merchant_name: payout.merchant_name.clone(),
            payout_month: payout.payout_month.clone(),
            payout_date: payout.payout_date.clone(),
            partner_id: payout.partner_airtable_id.clone(),
            partner_name: payout.partner_name.clone(),
            partner_role: payout.partner_role.clone(),
            split_pct: payout.partner_split_pct.to_f64().unwrap_or_default(),
            payout_amount: payout.partner_payout_amount.to_f64().unwrap_or_default(),
            volume: payout.volume.to_f64().unwrap_or_default(),
            fees: payout.fees.to_f64().unwrap_or_default(),
            net_residual: payout.net_residual.to_f64().unwrap_or_default(),
            payout_type,
            status: payout.assignment_status.as_str().to_string(),
            paid_status: payout.paid_status.as_str().to_string(),
            paid_at: payout
                .paid_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            is_legacy: if payout.is_legacy_import { "Yes" } else { "No" }.to_string(),
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ExternalRecord {
    pub fn payout_id(&self) -> Option<&str> {
        self.fields.get(PAYOUT_ID_FIELD).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalUpdate {
    pub id: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalPage {
    #[serde(default)]
    pub records: Vec<ExternalRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

/// The third-party table payouts are mirrored into.
#[async_trait]
pub trait ExternalPayoutStore: Send + Sync {
    /// One page of records, optionally restricted to the given payout ids.
    async fn list_page(&self, payout_ids: Option<&[String]>, offset: Option<&str>) -> AppResult<ExternalPage>;

    async fn create_records(&self, records: &[PayoutFields]) -> AppResult<usize>;

    async fn update_records(&self, records: &[ExternalUpdate]) -> AppResult<usize>;
}

#[derive(Clone)]
pub struct AirtableClient {
    settings: AirtableSettings,
    overrides: Option<SettingsStore>,
    client: reqwest::Client,
}

impl AirtableClient {
    /// Base and table ids are read from the settings table on each call, so
    /// operators can repoint the mirror without a restart.
    pub fn new(settings: AirtableSettings, overrides: SettingsStore) -> AppResult<Self> {
        Ok(Self {
            settings,
            overrides: Some(overrides),
            client: build_client()?,
        })
    }

    pub fn with_config(settings: AirtableSettings) -> AppResult<Self> {
        Ok(Self {
            settings,
            overrides: None,
            client: build_client()?,
        })
    }

    async fn table_url(&self) -> AppResult<String> {
        let base_id = self.resolve(AIRTABLE_BASE_ID, self.settings.base_id.as_deref()).await?;
        let table_id = self.resolve(AIRTABLE_TABLE_ID, self.settings.table_id.as_deref()).await?;
        match (base_id, table_id) {
            (Some(base), Some(table)) => Ok(format!(
                "{}/{}/{}",
                self.settings.api_url.trim_end_matches('/'),
                base,
                table
            )),
            _ => Err(AppError::Config(
                "airtable base id and table id must both be configured".to_string(),
            )),
        }
    }

    async fn resolve(&self, key: &str, fallback: Option<&str>) -> AppResult<Option<String>> {
        if let Some(store) = &self.overrides {
            if let Some(value) = store.get_string(key).await? {
                return Ok(Some(value));
            }
        }
        Ok(fallback.map(ToString::to_string))
    }
}

#[async_trait]
impl ExternalPayoutStore for AirtableClient {
    async fn list_page(&self, payout_ids: Option<&[String]>, offset: Option<&str>) -> AppResult<ExternalPage> {
        let url = self.table_url().await?;
        let mut query: Vec<(&str, String)> = vec![("pageSize", PAGE_SIZE.to_string())];
        if let Some(ids) = payout_ids {
            query.push(("filterByFormula", payout_id_formula(ids)));
        }
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let res = self
            .client
            .get(url)
            .bearer_auth(&self.settings.api_key)
            .query(&query)
            .send()
            .await
            .map_err(|e| AppError::External(format!("airtable list failed: {e}")))?;

        let body = parse_success_json(res).await?;
        serde_json::from_value(body)
            .map_err(|e| AppError::External(format!("airtable list response malformed: {e}")))
    }

    async fn create_records(&self, records: &[PayoutFields]) -> AppResult<usize> {
        let url = self.table_url().await?;
        let payload: Vec<Value> = records.iter().map(|r| json!({ "fields": r })).collect();
        let res = self
            .client
            .post(url)
            .bearer_auth(&self.settings.api_key)
            .json(&json!({ "records": payload }))
            .send()
            .await
            .map_err(|e| AppError::External(format!("airtable create failed: {e}")))?;

        let body = parse_success_json(res).await?;
        Ok(record_count(&body))
    }

    async fn update_records(&self, records: &[ExternalUpdate]) -> AppResult<usize> {
        let url = self.table_url().await?;
        let res = self
            .client
            .patch(url)
            .bearer_auth(&self.settings.api_key)
            .json(&json!({ "records": records }))
            .send()
            .await
            .map_err(|e| AppError::External(format!("airtable update failed: {e}")))?;

        let body = parse_success_json(res).await?;
        Ok(record_count(&body))
    }
}

/// `OR({Payout ID}="a",{Payout ID}="b")` with quotes escaped.
pub fn payout_id_formula(ids: &[String]) -> String {
    let clauses: Vec<String> = ids
        .iter()
        .map(|id| format!("{{{PAYOUT_ID_FIELD}}}=\"{}\"", id.replace('"', "\\\"")))
        .collect();
    format!("OR({})", clauses.join(","))
}

fn record_count(body: &Value) -> usize {
    body.get("records")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_default()
}

async fn parse_success_json(res: reqwest::Response) -> AppResult<Value> {
    let status = res.status();
    let text = res
        .text()
        .await
        .map_err(|e| AppError::External(format!("airtable response read failed: {e}")))?;

    if !status.is_success() {
        return Err(AppError::External(format!("airtable http {status}: {text}")));
    }

    serde_json::from_str(&text)
        .map_err(|e| AppError::External(format!("airtable response parse failed: {e}")))
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use residuals_common::config::AirtableSettings;
    use residuals_common::error::AppError;

    use super::{payout_id_formula, AirtableClient, ExternalPayoutStore, ExternalUpdate};

    fn client(url: String) -> AirtableClient {
        AirtableClient::with_config(AirtableSettings {
            api_key: "key-test".to_string(),
            api_url: url,
            base_id: Some("appBase".to_string()),
            table_id: Some("tblPayouts".to_string()),
        })
        .expect("client")
    }

    #[test]
    fn formula_matches_each_payout_id() {
        let formula = payout_id_formula(&["p1".to_string(), "p2".to_string()]);
        assert_eq!(formula, r#"OR({Payout ID}="p1",{Payout ID}="p2")"#);
    }

    #[tokio::test]
    async fn list_page_sends_page_size_offset_and_auth() {
        let mut server = Server::new_async().await;
        let _list = server
            .mock("GET", "/appBase/tblPayouts")
            .match_header("authorization", "Bearer key-test")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("pageSize".to_string(), "100".to_string()),
                Matcher::UrlEncoded("offset".to_string(), "itr1".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records":[{"id":"rec1","fields":{"Payout ID":"p1","Paid Status":"unpaid"}}],"offset":"itr2"}"#)
            .create_async()
            .await;

        let page = client(server.url())
            .list_page(None, Some("itr1"))
            .await
            .expect("page");

        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].payout_id(), Some("p1"));
        assert_eq!(page.offset.as_deref(), Some("itr2"));
    }

    #[tokio::test]
    async fn update_uses_patch_with_records_envelope() {
        let mut server = Server::new_async().await;
        let _patch = server
            .mock("PATCH", "/appBase/tblPayouts")
            .match_body(Matcher::PartialJsonString(
                r#"{"records":[{"id":"rec1","fields":{"Paid Status":"paid"}}]}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records":[{"id":"rec1","fields":{}}]}"#)
            .create_async()
            .await;

        let mut fields = serde_json::Map::new();
        fields.insert("Paid Status".to_string(), serde_json::json!("paid"));
        let updated = client(server.url())
            .update_records(&[ExternalUpdate {
                id: "rec1".to_string(),
                fields,
            }])
            .await
            .expect("update");
        assert_eq!(updated, 1);
    }

    #[tokio::test]
    async fn rate_limit_response_is_external_error() {
        let mut server = Server::new_async().await;
        let _create = server
            .mock("POST", "/appBase/tblPayouts")
            .with_status(429)
            .with_body(r#"{"error":{"type":"RATE_LIMITED"}}"#)
            .create_async()
            .await;

        let err = client(server.url())
            .create_records(&[])
            .await
            .expect_err("429 must fail");
        match err {
            AppError::External(message) => assert!(message.contains("429")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_table_is_config_error() {
        let client = AirtableClient::with_config(AirtableSettings {
            api_key: "key".to_string(),
            api_url: "http://127.0.0.1:1".to_string(),
            base_id: None,
            table_id: None,
        })
        .expect("client");
        let err = client.list_page(None, None).await.expect_err("unconfigured");
        assert!(matches!(err, AppError::Config(_)));
    }
}
