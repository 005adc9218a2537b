//! Participant records arrive in several historical shapes. Every shape is
//! folded into [`Participant`] at deserialization time, so code past the
//! boundary only ever sees the canonical form.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PARTNER_ROLE: &str = "Partner";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ParticipantInput")]
pub struct Participant {
    pub partner_airtable_id: String,
    pub partner_name: String,
    pub partner_role: String,
    pub split_pct: Decimal,
}

/// Wire shapes accepted for a participant.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParticipantInput {
    Canonical(CanonicalParticipant),
    Legacy(LegacyParticipant),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalParticipant {
    pub partner_airtable_id: String,
    pub partner_name: String,
    pub partner_role: String,
    pub split_pct: Decimal,
}

/// Any mixture of the older field names. Values stay loosely typed because
/// historical rows carry numbers and numeric strings interchangeably.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyParticipant {
    #[serde(default)]
    pub partner_airtable_id: Option<Value>,
    #[serde(default)]
    pub partner_id: Option<Value>,
    #[serde(default)]
    pub agent_id: Option<Value>,
    #[serde(default)]
    pub partner_name: Option<Value>,
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default)]
    pub partner_role: Option<Value>,
    #[serde(default)]
    pub role: Option<Value>,
    #[serde(default)]
    pub split_pct: Option<Value>,
    #[serde(default)]
    pub split: Option<Value>,
}

impl From<ParticipantInput> for Participant {
    fn from(input: ParticipantInput) -> Self {
        match input {
            ParticipantInput::Canonical(p) => Participant {
                partner_airtable_id: p.partner_airtable_id.trim().to_string(),
                partner_name: p.partner_name.trim().to_string(),
                partner_role: non_empty(p.partner_role.trim())
                    .unwrap_or_else(|| DEFAULT_PARTNER_ROLE.to_string()),
                split_pct: p.split_pct,
            },
            ParticipantInput::Legacy(p) => normalize_legacy(p),
        }
    }
}

fn normalize_legacy(p: LegacyParticipant) -> Participant {
    let partner_airtable_id = first_text(&[&p.partner_airtable_id, &p.partner_id, &p.agent_id])
        .unwrap_or_default();
    let partner_name = first_text(&[&p.partner_name, &p.name]).unwrap_or_default();
    let partner_role = first_text(&[&p.partner_role, &p.role])
        .unwrap_or_else(|| DEFAULT_PARTNER_ROLE.to_string());
    let split_pct = first_number(&[&p.split_pct, &p.split]).unwrap_or(Decimal::ZERO);

    Participant {
        partner_airtable_id,
        partner_name,
        partner_role,
        split_pct,
    }
}

/// Normalize an arbitrary JSON participant value. Values that are not
/// objects normalize to an empty participant with a zero split.
pub fn normalize_value(value: Value) -> Participant {
    serde_json::from_value::<ParticipantInput>(value)
        .map(Participant::from)
        .unwrap_or_else(|_| normalize_legacy(LegacyParticipant::default()))
}

/// Parse a stored `participants_json` document. Anything other than an
/// array yields an empty list.
pub fn normalize_list(value: Value) -> Vec<Participant> {
    match value {
        Value::Array(items) => items.into_iter().map(normalize_value).collect(),
        _ => Vec::new(),
    }
}

pub fn split_total(participants: &[Participant]) -> Decimal {
    participants.iter().map(|p| p.split_pct).sum()
}

fn first_text(candidates: &[&Option<Value>]) -> Option<String> {
    candidates.iter().find_map(|candidate| match candidate {
        Some(Value::String(s)) => non_empty(s.trim()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn first_number(candidates: &[&Option<Value>]) -> Option<Decimal> {
    candidates.iter().find_map(|candidate| match candidate {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{normalize_list, normalize_value, split_total, Participant};

    fn canonical(id: &str, name: &str, role: &str, pct: i64) -> Participant {
        Participant {
            partner_airtable_id: id.to_string(),
            partner_name: name.to_string(),
            partner_role: role.to_string(),
            split_pct: Decimal::new(pct, 0),
        }
    }

    #[test]
    fn canonical_shape_passes_through() {
        let p = normalize_value(json!({
            "partner_airtable_id": "rec1",
            "partner_name": "Alice",
            "partner_role": "Agent",
            "split_pct": 35
        }));
        assert_eq!(p, canonical("rec1", "Alice", "Agent", 35));
    }

    #[test]
    fn legacy_fields_resolve_in_order() {
        let p = normalize_value(json!({
            "agent_id": "agent-9",
            "partner_id": "rec-legacy",
            "name": "Bob",
            "role": "ISO",
            "split": "12.5"
        }));
        assert_eq!(p.partner_airtable_id, "rec-legacy");
        assert_eq!(p.partner_name, "Bob");
        assert_eq!(p.partner_role, "ISO");
        assert_eq!(p.split_pct, Decimal::new(125, 1));

        let p = normalize_value(json!({
            "partner_airtable_id": "recA",
            "partner_id": "recB",
            "partner_name": "Canon",
            "name": "Legacy",
            "split_pct": 40,
            "split": 10
        }));
        assert_eq!(p.partner_airtable_id, "recA");
        assert_eq!(p.partner_name, "Canon");
        assert_eq!(p.split_pct, Decimal::new(40, 0));
    }

    #[test]
    fn defaults_apply_for_missing_or_garbage_values() {
        let p = normalize_value(json!({"agent_id": "a1", "split_pct": "n/a"}));
        assert_eq!(p.partner_role, "Partner");
        assert_eq!(p.split_pct, Decimal::ZERO);
        assert_eq!(p.partner_name, "");

        let p = normalize_value(json!({"partner_id": "", "agent_id": 42, "role": ""}));
        assert_eq!(p.partner_airtable_id, "42");
        assert_eq!(p.partner_role, "Partner");

        let p = normalize_value(json!("not an object"));
        assert_eq!(p.split_pct, Decimal::ZERO);
    }

    #[test]
    fn normalization_is_idempotent() {
        let shapes = vec![
            json!({"partner_airtable_id": "rec1", "partner_name": "A", "partner_role": "Agent", "split_pct": 35}),
            json!({"agent_id": "ag", "name": "B", "split": "20.25"}),
            json!({"partner_id": "p", "role": "Fund", "split_pct": null}),
            json!({}),
        ];

        for shape in shapes {
            let once = normalize_value(shape);
            let reserialized = serde_json::to_value(&once).expect("serialize");
            let twice = normalize_value(reserialized);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn list_normalizes_each_entry_and_sums() {
        let list = normalize_list(json!([
            {"partner_airtable_id": "r1", "partner_name": "A", "partner_role": "Agent", "split_pct": 60},
            {"agent_id": "r2", "name": "B", "split": 40}
        ]));
        assert_eq!(list.len(), 2);
        assert_eq!(split_total(&list), Decimal::new(100, 0));
        assert!(normalize_list(json!({"not": "a list"})).is_empty());
    }

    #[test]
    fn deserializing_participant_applies_normalizer() {
        let p: Participant =
            serde_json::from_value(json!({"agent_id": "x", "split": 5})).expect("participant");
        assert_eq!(p, canonical("x", "", "Partner", 5));
    }
}
