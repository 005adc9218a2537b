use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::participant::{split_total, Participant};

/// Inclusive acceptance band for the sum of participant splits. It is wider
/// than exactly 100 to tolerate legacy rounding.
pub const SPLIT_TOTAL_MIN: Decimal = Decimal::from_parts(80, 0, 0, false, 0);
pub const SPLIT_TOTAL_MAX: Decimal = Decimal::from_parts(105, 0, 0, false, 0);

/// Revenue columns of one event. Missing values count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RevenueInputs {
    pub fees: Option<Decimal>,
    pub adjustments: Option<Decimal>,
    pub chargebacks: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAmount {
    pub participant: Participant,
    pub amount: Decimal,
}

impl RevenueInputs {
    pub fn net_residual(&self) -> Decimal {
        let fees = self.fees.unwrap_or_default();
        let adjustments = self.adjustments.unwrap_or_default();
        let chargebacks = self.chargebacks.unwrap_or_default();
        fees.checked_sub(adjustments)
            .and_then(|v| v.checked_sub(chargebacks))
            .unwrap_or_default()
    }
}

/// `net_residual * split_pct / 100`, unrounded. Overflow yields zero.
pub fn participant_amount(net_residual: Decimal, split_pct: Decimal) -> Decimal {
    net_residual
        .checked_mul(split_pct)
        .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
        .unwrap_or_default()
}

/// Each participant's share of the net residual, computed independently.
/// Shares are not normalized to any total and carry the sign of the residual.
pub fn split_residual(inputs: RevenueInputs, participants: &[Participant]) -> Vec<ParticipantAmount> {
    let net = inputs.net_residual();
    participants
        .iter()
        .map(|p| ParticipantAmount {
            participant: p.clone(),
            amount: participant_amount(net, p.split_pct),
        })
        .collect()
}

pub fn validate_split_total(participants: &[Participant]) -> AppResult<Decimal> {
    let total = split_total(participants);
    if total < SPLIT_TOTAL_MIN || total > SPLIT_TOTAL_MAX {
        return Err(AppError::validation(format!(
            "Total split ({}%) should be between 80% and 105%",
            total.normalize()
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{participant_amount, split_residual, validate_split_total, RevenueInputs};
    use crate::participant::Participant;

    fn participant(pct: Decimal) -> Participant {
        Participant {
            partner_airtable_id: "rec".to_string(),
            partner_name: "P".to_string(),
            partner_role: "Agent".to_string(),
            split_pct: pct,
        }
    }

    #[test]
    fn amount_is_proportional_to_split() {
        assert_eq!(
            participant_amount(Decimal::new(1000, 0), Decimal::new(35, 0)),
            Decimal::new(350, 0)
        );
        assert_eq!(
            participant_amount(Decimal::new(-200, 0), Decimal::new(50, 0)),
            Decimal::new(-100, 0)
        );
        assert_eq!(
            participant_amount(Decimal::new(12345, 2), Decimal::new(125, 1)),
            Decimal::new(15431250, 6)
        );
    }

    #[test]
    fn net_residual_subtracts_adjustments_and_chargebacks() {
        let inputs = RevenueInputs {
            fees: Some(Decimal::new(1000, 0)),
            adjustments: Some(Decimal::new(150, 0)),
            chargebacks: Some(Decimal::new(1050, 0)),
        };
        assert_eq!(inputs.net_residual(), Decimal::new(-200, 0));
        assert_eq!(RevenueInputs::default().net_residual(), Decimal::ZERO);
    }

    #[test]
    fn split_residual_keeps_sign_and_does_not_normalize() {
        let inputs = RevenueInputs {
            fees: Some(Decimal::new(-200, 0)),
            adjustments: None,
            chargebacks: None,
        };
        let shares = split_residual(
            inputs,
            &[participant(Decimal::new(50, 0)), participant(Decimal::new(55, 0))],
        );
        assert_eq!(shares[0].amount, Decimal::new(-100, 0));
        assert_eq!(shares[1].amount, Decimal::new(-110, 0));
    }

    #[test]
    fn split_total_band_is_inclusive() {
        let accepted = [Decimal::new(800, 1), Decimal::new(100, 0), Decimal::new(1050, 1)];
        for total in accepted {
            validate_split_total(&[participant(total)]).expect("accepted");
        }

        let err = validate_split_total(&[participant(Decimal::new(799, 1))]).expect_err("low");
        assert!(err.to_string().contains("79.9%"));
        let err = validate_split_total(&[participant(Decimal::new(1051, 1))]).expect_err("high");
        assert!(err.to_string().contains("105.1%"));
    }
}
