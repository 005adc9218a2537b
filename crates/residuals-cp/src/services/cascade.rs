use std::time::Duration;

use residuals_common::api::{CascadeReport, CascadeStepReport};
use residuals_common::error::AppResult;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::stores::deal::DealStore;
use crate::stores::event::EventStore;
use crate::stores::payout::PayoutStore;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// One idempotent unit of a cascading delete. Re-running a step that already
/// succeeded affects zero rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeStep {
    DeletePayoutsForEvents(Vec<Uuid>),
    DeletePayoutsForDealToken(String),
    ResetEvents(Vec<Uuid>),
    DeleteDeal(Uuid),
    DeleteEvent(Uuid),
}

impl CascadeStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeletePayoutsForEvents(_) => "delete_payouts_for_events",
            Self::DeletePayoutsForDealToken(_) => "delete_payouts_for_deal_token",
            Self::ResetEvents(_) => "reset_events",
            Self::DeleteDeal(_) => "delete_deal",
            Self::DeleteEvent(_) => "delete_event",
        }
    }

    /// Terminal steps remove the row the earlier steps hang off of. They
    /// only run when nothing before them failed.
    fn is_terminal(&self) -> bool {
        matches!(self, Self::DeleteDeal(_) | Self::DeleteEvent(_))
    }
}

#[derive(Clone)]
pub struct Cascade {
    events: EventStore,
    deals: DealStore,
    payouts: PayoutStore,
}

impl Cascade {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            events: EventStore::new(pool.clone()),
            deals: DealStore::new(pool.clone()),
            payouts: PayoutStore::new(pool),
        }
    }

    /// Run every step in order. A failing step is retried, then recorded, and
    /// the remaining non-terminal steps still run.
    pub async fn run(&self, steps: Vec<CascadeStep>) -> CascadeReport {
        let mut report = CascadeReport::default();

        for step in steps {
            if step.is_terminal() && report.failed() {
                warn!(step = step.name(), "skipping cascade step after earlier failure");
                report.steps.push(CascadeStepReport {
                    step: step.name().to_string(),
                    affected: 0,
                    attempts: 0,
                    error: Some("skipped: an earlier step failed".to_string()),
                });
                continue;
            }

            let mut attempts = 0;
            let mut outcome = Ok(0);
            while attempts < MAX_ATTEMPTS {
                attempts += 1;
                outcome = self.execute(&step).await;
                match &outcome {
                    Ok(_) => break,
                    Err(err) => {
                        warn!(step = step.name(), attempt = attempts, error = %err, "cascade step failed");
                        if attempts < MAX_ATTEMPTS {
                            tokio::time::sleep(RETRY_BACKOFF * attempts).await;
                        }
                    }
                }
            }

            let (affected, error) = match outcome {
                Ok(affected) => (affected, None),
                Err(err) => (0, Some(err.to_string())),
            };
            info!(step = step.name(), affected, attempts, "cascade step finished");
            report.steps.push(CascadeStepReport {
                step: step.name().to_string(),
                affected,
                attempts,
                error,
            });
        }

        report
    }

    async fn execute(&self, step: &CascadeStep) -> AppResult<u64> {
        match step {
            CascadeStep::DeletePayoutsForEvents(event_ids) => self.payouts.delete_for_events(event_ids).await,
            CascadeStep::DeletePayoutsForDealToken(token) => self.payouts.delete_for_deal_token(token).await,
            CascadeStep::ResetEvents(event_ids) => {
                let mut affected = 0;
                for id in event_ids {
                    affected += self.events.reset(*id).await?;
                }
                Ok(affected)
            }
            CascadeStep::DeleteDeal(id) => {
                // Events assigned after the cascade was planned must not be left
                // pointing at a missing deal.
                self.events.reset_by_deal(*id).await?;
                self.deals.delete(*id).await
            }
            CascadeStep::DeleteEvent(id) => self.events.delete(*id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use residuals_common::participant::Participant;
    use residuals_common::types::AssignmentStatus;
    use rust_decimal::Decimal;

    use super::{Cascade, CascadeStep};
    use crate::db::memory_pool;
    use crate::stores::deal::{DealStore, NewDeal};
    use crate::stores::event::{AssignmentUpdate, EventStore, NewEvent};

    fn new_event(hash: &str) -> NewEvent {
        NewEvent {
            row_hash: hash.to_string(),
            batch_id: "batch-1".to_string(),
            mid: "4455".to_string(),
            merchant_name: Some("Corner Cafe".to_string()),
            volume: Decimal::new(10_000, 0),
            fees: Decimal::new(500, 0),
            adjustments: Decimal::ZERO,
            chargebacks: Decimal::ZERO,
            date: None,
            payout_month: Some("2024-03".to_string()),
            payout_type: "residual".to_string(),
            raw_data: None,
        }
    }

    async fn seeded(pool: &sqlx::SqlitePool) -> (uuid::Uuid, uuid::Uuid, String) {
        let events = EventStore::new(pool.clone());
        let deals = DealStore::new(pool.clone());
        let event_id = events.insert_if_new(new_event("h1")).await.expect("insert").expect("new");
        let deal = deals
            .create(NewDeal {
                deal_id: "deal_test".to_string(),
                mid: "4455".to_string(),
                participants: vec![Participant {
                    partner_airtable_id: "rec1".to_string(),
                    partner_name: "Ada".to_string(),
                    partner_role: "Partner".to_string(),
                    split_pct: Decimal::new(100, 0),
                }],
                payout_type: "residual".to_string(),
                assigned_agent_name: Some("Ada".to_string()),
            })
            .await
            .expect("deal");
        events
            .assign(
                &[event_id],
                &AssignmentUpdate {
                    deal_id: deal.id,
                    assigned_agent_id: Some("rec1".to_string()),
                    assigned_agent_name: Some("Ada".to_string()),
                    payout_type: "residual".to_string(),
                },
            )
            .await
            .expect("assign");
        (event_id, deal.id, deal.deal_id)
    }

    #[tokio::test]
    async fn rerunning_a_finished_cascade_affects_nothing() {
        let pool = memory_pool().await.expect("pool");
        let (event_id, deal_id, token) = seeded(&pool).await;
        let cascade = Cascade::new(pool.clone());
        let steps = vec![
            CascadeStep::DeletePayoutsForEvents(vec![event_id]),
            CascadeStep::DeletePayoutsForDealToken(token),
            CascadeStep::ResetEvents(vec![event_id]),
            CascadeStep::DeleteDeal(deal_id),
        ];

        let first = cascade.run(steps.clone()).await;
        assert!(!first.failed());
        assert_eq!(first.affected("reset_events"), 1);
        assert_eq!(first.affected("delete_deal"), 1);

        let second = cascade.run(steps).await;
        assert!(!second.failed());
        assert_eq!(second.affected("delete_deal"), 0);

        let event = EventStore::new(pool).get(event_id).await.expect("get").expect("event");
        assert_eq!(event.assignment_status, AssignmentStatus::Unassigned);
        assert_eq!(event.deal_id, None);
    }

    #[tokio::test]
    async fn deal_survives_when_an_earlier_step_fails() {
        let pool = memory_pool().await.expect("pool");
        let (event_id, deal_id, _) = seeded(&pool).await;
        sqlx::query("DROP TABLE payouts").execute(&pool).await.expect("drop");

        let report = Cascade::new(pool.clone())
            .run(vec![
                CascadeStep::DeletePayoutsForEvents(vec![event_id]),
                CascadeStep::ResetEvents(vec![event_id]),
                CascadeStep::DeleteDeal(deal_id),
            ])
            .await;

        assert!(report.failed());
        assert_eq!(report.steps[0].attempts, 3);
        assert_eq!(report.affected("reset_events"), 1);
        assert_eq!(report.steps[2].attempts, 0);
        assert!(DealStore::new(pool).get(deal_id).await.expect("get").is_some());
    }
}
