use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    errors::ServiceError,
    services::{payments::PaymentService, reconciliation::ApplyOutcome},
};

/// Counts from one pass over overdue intents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct SweepReport {
    /// Intents asked about at the provider
    pub polled: u32,
    /// Polls that settled the intent
    pub settled: u32,
    pub expired: u32,
    /// Stuck `initiating` claims released
    pub abandoned: u32,
    pub errors: u32,
}

/// Catches payments whose webhook never arrived and releases orders whose
/// customer walked away.
#[derive(Clone)]
pub struct ReconciliationSweep {
    payments: PaymentService,
}

impl ReconciliationSweep {
    pub fn new(payments: PaymentService) -> Self {
        Self { payments }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for intent in self.payments.intents().find_expired(now).await? {
            report.polled += 1;
            match self.payments.poll(&intent).await {
                Ok(Some(
                    ApplyOutcome::Applied { intent_status, .. }
                    | ApplyOutcome::Stale { intent_status },
                )) if intent_status.is_terminal() =>
                {
                    report.settled += 1;
                }
                Ok(_) => {
                    self.payments.expire(&intent).await?;
                    report.expired += 1;
                }
                Err(e) => {
                    // Provider unreachable; try again next pass rather than expiring a paid intent
                    warn!(intent_id = %intent.id, "Sweep poll failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        let stale = self
            .payments
            .intents()
            .find_stale_claims(now, self.payments.claim_timeout())
            .await?;
        for intent in stale {
            match self
                .payments
                .intents()
                .abandon(intent.id, "initiation timed out")
                .await
            {
                Ok(_) => report.abandoned += 1,
                Err(ServiceError::Conflict(_)) => {}
                Err(e) => {
                    warn!(intent_id = %intent.id, "Could not release stale claim: {}", e);
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("storefront.sweep.runs", 1);
        metrics::counter!("storefront.sweep.expired", report.expired as u64);
        if report != SweepReport::default() {
            info!(?report, "Reconciliation sweep finished");
        }
        Ok(report)
    }

    /// Runs the sweep every `interval` on a background task.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting reconciliation sweep");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("reconciliation sweep error: {}", e);
                }
            }
        })
    }
}
