//! Column resolution for imported revenue rows. Headers are matched against
//! known aliases case-insensitively; the first alias present wins.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::mid::normalize_mid;

const MID: &[&str] = &[
    "mid",
    "merchant id",
    "merchant_id",
    "merchantid",
    "merchant_identifier",
];
const MERCHANT_NAME: &[&str] = &[
    "merchant_name",
    "merchant name",
    "merchantname",
    "company_name",
    "business_name",
    "name",
];
const VOLUME: &[&str] = &[
    "volume",
    "transaction_volume",
    "monthly_volume",
    "total_volume",
    "sales",
];
const FEES: &[&str] = &[
    "fees",
    "payout_amount",
    "payout amount",
    "payout",
    "payouts",
    "net_payout",
    "residual_amount",
];
const DATE: &[&str] = &[
    "date",
    "txn_date",
    "transaction date",
    "payment_date",
    "process_date",
];
const PAYOUT_MONTH: &[&str] = &[
    "payout_month",
    "payout month",
    "month",
    "processing_month",
    "period",
];
const ADJUSTMENTS: &[&str] = &["adjustments", "adjustment"];
const CHARGEBACKS: &[&str] = &["chargebacks", "chargeback"];

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedRow {
    pub mid: String,
    pub merchant_name: Option<String>,
    pub volume: Decimal,
    pub fees: Decimal,
    pub adjustments: Decimal,
    pub chargebacks: Decimal,
    pub date: Option<String>,
    pub payout_month: Option<String>,
    pub row_hash: String,
}

/// Map one raw row onto event columns. `default_month` is used when the row
/// carries neither a payout month nor a dated column.
pub fn resolve_row(row: &Map<String, Value>, default_month: Option<&str>) -> Result<ImportedRow, String> {
    let mid = lookup(row, MID)
        .and_then(text)
        .map(|raw| normalize_mid(&raw))
        .filter(|mid| !mid.is_empty())
        .ok_or_else(|| "missing merchant id".to_string())?;

    let date = lookup(row, DATE).and_then(text);
    let payout_month = lookup(row, PAYOUT_MONTH)
        .and_then(text)
        .and_then(|m| month_prefix(&m))
        .or_else(|| date.as_deref().and_then(month_prefix))
        .or_else(|| default_month.map(ToString::to_string));

    Ok(ImportedRow {
        mid,
        merchant_name: lookup(row, MERCHANT_NAME).and_then(text),
        volume: lookup(row, VOLUME).map(parse_amount).unwrap_or_default(),
        fees: lookup(row, FEES).map(parse_amount).unwrap_or_default(),
        adjustments: lookup(row, ADJUSTMENTS).map(parse_amount).unwrap_or_default(),
        chargebacks: lookup(row, CHARGEBACKS).map(parse_amount).unwrap_or_default(),
        date,
        payout_month,
        row_hash: row_hash(row),
    })
}

/// SHA-256 over the row's canonical JSON form (keys sorted).
pub fn row_hash(row: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = row.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0x1f]);
        hasher.update(row[key].to_string().as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Lenient money parsing: currency symbols and thousands separators are
/// dropped, `(12.50)` is negative, and anything unparsable is zero.
pub fn parse_amount(value: &Value) -> Decimal {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .unwrap_or_default(),
        Value::String(s) => {
            let trimmed = s.trim();
            let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
            let cleaned: String = trimmed
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
                .collect();
            let amount = Decimal::from_str(&cleaned).unwrap_or_default();
            if negative {
                -amount
            } else {
                amount
            }
        }
        _ => Decimal::ZERO,
    }
}

/// `true` for strings shaped like `YYYY-MM`.
pub fn is_payout_month(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
        && matches!(&raw[5..], "01" | "02" | "03" | "04" | "05" | "06" | "07" | "08" | "09" | "10" | "11" | "12")
}

fn month_prefix(raw: &str) -> Option<String> {
    let candidate = raw.trim().get(..7)?;
    is_payout_month(candidate).then(|| candidate.to_string())
}

fn lookup<'a>(row: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| {
        row.iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(alias))
            .map(|(_, value)| value)
            .filter(|value| !value.is_null())
    })
}

fn text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::{json, Map, Value};

    use super::{is_payout_month, parse_amount, resolve_row, row_hash};

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn aliases_match_case_insensitively() {
        let parsed = resolve_row(
            &row(json!({
                "Merchant ID": " 2266-0744 ",
                "Business_Name": "Corner Cafe",
                "Sales": "12,500.00",
                "Payout Amount": "$1,000.00",
                "Adjustment": "25",
                "Chargebacks": 0,
                "Transaction Date": "2024-03-14"
            })),
            None,
        )
        .expect("row");

        assert_eq!(parsed.mid, "22660744");
        assert_eq!(parsed.merchant_name.as_deref(), Some("Corner Cafe"));
        assert_eq!(parsed.volume, Decimal::new(12500, 0));
        assert_eq!(parsed.fees, Decimal::new(1000, 0));
        assert_eq!(parsed.adjustments, Decimal::new(25, 0));
        assert_eq!(parsed.payout_month.as_deref(), Some("2024-03"));
    }

    #[test]
    fn explicit_month_beats_date_and_default() {
        let parsed = resolve_row(
            &row(json!({"mid": "1", "period": "2024-05", "date": "2024-03-01"})),
            Some("2023-12"),
        )
        .expect("row");
        assert_eq!(parsed.payout_month.as_deref(), Some("2024-05"));

        let parsed = resolve_row(&row(json!({"mid": "1"})), Some("2023-12")).expect("row");
        assert_eq!(parsed.payout_month.as_deref(), Some("2023-12"));
    }

    #[test]
    fn missing_mid_is_rejected() {
        let err = resolve_row(&row(json!({"merchant_name": "x", "mid": "  "})), None)
            .expect_err("no mid");
        assert!(err.contains("merchant id"));
    }

    #[test]
    fn amounts_parse_leniently() {
        assert_eq!(parse_amount(&json!("(12.50)")), Decimal::new(-1250, 2));
        assert_eq!(parse_amount(&json!("n/a")), Decimal::ZERO);
        assert_eq!(parse_amount(&json!(7.25)), Decimal::new(725, 2));
        assert_eq!(parse_amount(&Value::Null), Decimal::ZERO);
    }

    #[test]
    fn hash_ignores_key_order_but_not_values() {
        let a = row(json!({"mid": "1", "fees": "10"}));
        let b = row(json!({"fees": "10", "mid": "1"}));
        let c = row(json!({"mid": "1", "fees": "11"}));
        assert_eq!(row_hash(&a), row_hash(&b));
        assert_ne!(row_hash(&a), row_hash(&c));
    }

    #[test]
    fn payout_month_shape() {
        assert!(is_payout_month("2024-01"));
        assert!(!is_payout_month("2024-13"));
        assert!(!is_payout_month("2024-1"));
        assert!(!is_payout_month("24-01-01"));
    }
}
