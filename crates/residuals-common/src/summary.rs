//! Read-side folds over payout rows. Nothing here is persisted; every
//! summary is recomputed from the rows passed in.

use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::columns::is_payout_month;
use crate::types::{PaidStatus, PayoutRecord};

const UNSCHEDULED: &str = "unscheduled";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub payout_count: usize,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub unpaid_amount: Decimal,
    pub net_residual: Decimal,
}

impl Totals {
    fn add(&mut self, payout: &PayoutRecord) {
        self.payout_count += 1;
        self.total_amount += payout.partner_payout_amount;
        self.net_residual += payout.net_residual;
        match payout.paid_status {
            PaidStatus::Paid => self.paid_amount += payout.partner_payout_amount,
            PaidStatus::Unpaid => self.unpaid_amount += payout.partner_payout_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub payout_month: String,
    pub partner_count: usize,
    #[serde(flatten)]
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlySummary {
    pub quarter: String,
    pub months: Vec<String>,
    #[serde(flatten)]
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub partner_airtable_id: String,
    pub partner_name: Option<String>,
    pub partner_role: String,
    pub months: Vec<String>,
    #[serde(flatten)]
    pub totals: Totals,
}

/// `2024-05` becomes `2024-Q2`.
pub fn quarter_of(payout_month: &str) -> Option<String> {
    if !is_payout_month(payout_month) {
        return None;
    }
    let year = &payout_month[..4];
    let month: u32 = payout_month[5..].parse().ok()?;
    Some(format!("{year}-Q{}", month.div_ceil(3)))
}

/// Newest month first. Payouts without a month are grouped as `unscheduled`.
pub fn monthly(payouts: &[PayoutRecord]) -> Vec<MonthlySummary> {
    let mut by_month: BTreeMap<String, (Totals, BTreeSet<String>)> = BTreeMap::new();
    for payout in payouts {
        let key = payout
            .payout_month
            .clone()
            .unwrap_or_else(|| UNSCHEDULED.to_string());
        let (totals, partners) = by_month.entry(key).or_default();
        totals.add(payout);
        partners.insert(payout.partner_airtable_id.clone());
    }

    by_month
        .into_iter()
        .rev()
        .map(|(payout_month, (totals, partners))| MonthlySummary {
            payout_month,
            partner_count: partners.len(),
            totals,
        })
        .collect()
}

/// Newest quarter first. Payouts without a valid month are skipped.
pub fn quarterly(payouts: &[PayoutRecord]) -> Vec<QuarterlySummary> {
    let mut by_quarter: BTreeMap<String, (Totals, BTreeSet<String>)> = BTreeMap::new();
    for payout in payouts {
        let Some(month) = payout.payout_month.as_deref() else {
            continue;
        };
        let Some(quarter) = quarter_of(month) else {
            continue;
        };
        let (totals, months) = by_quarter.entry(quarter).or_default();
        totals.add(payout);
        months.insert(month.to_string());
    }

    by_quarter
        .into_iter()
        .rev()
        .map(|(quarter, (totals, months))| QuarterlySummary {
            quarter,
            months: months.into_iter().collect(),
            totals,
        })
        .collect()
}

/// Largest total first; ties broken by partner id.
pub fn by_participant(payouts: &[PayoutRecord]) -> Vec<ParticipantSummary> {
    let mut by_partner: BTreeMap<String, ParticipantSummary> = BTreeMap::new();
    let mut months: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for payout in payouts {
        let entry = by_partner
            .entry(payout.partner_airtable_id.clone())
            .or_insert_with(|| ParticipantSummary {
                partner_airtable_id: payout.partner_airtable_id.clone(),
                partner_name: payout.partner_name.clone(),
                partner_role: payout.partner_role.clone(),
                months: Vec::new(),
                totals: Totals::default(),
            });
        entry.totals.add(payout);
        if let Some(month) = &payout.payout_month {
            months
                .entry(payout.partner_airtable_id.clone())
                .or_default()
                .insert(month.clone());
        }
    }

    let mut out: Vec<ParticipantSummary> = by_partner
        .into_iter()
        .map(|(id, mut summary)| {
            summary.months = months.remove(&id).unwrap_or_default().into_iter().collect();
            summary
        })
        .collect();
    out.sort_by(|a, b| {
        b.totals
            .total_amount
            .cmp(&a.totals.total_amount)
            .then_with(|| a.partner_airtable_id.cmp(&b.partner_airtable_id))
    });
    out
}
