//! Repair the broker from the ledger after a crash or broker outage.

use serde::Serialize;
use tracing::{Span, instrument};

use std::{sync::Arc, time::Duration};

use super::{
    broker::JobBroker,
    entity::JobStatus,
    error::JobError,
    ledger::JobLedger,
    time::{ClockHandle, chrono_duration},
};

/// Outcome of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending records inspected.
    pub scanned: usize,
    /// References pushed because the broker did not hold them.
    pub requeued: usize,
    pub already_present: usize,
    /// Records whose broker check or push failed.
    pub failed: usize,
}

/// Re-enqueues every recent `QUEUED` or `STARTED` record that its lane no
/// longer holds. Running it repeatedly is harmless: present references are left alone.
pub struct JobReconciler {
    ledger: Arc<dyn JobLedger>,
    broker: Arc<dyn JobBroker>,
    clock: ClockHandle,
    window: Duration,
}

impl JobReconciler {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        broker: Arc<dyn JobBroker>,
        clock: ClockHandle,
        window: Duration,
    ) -> Self {
        Self {
            ledger,
            broker,
            clock,
            window,
        }
    }

    #[instrument(
        name = "job.reconcile",
        skip(self),
        fields(scanned, requeued, already_present, failed),
        err
    )]
    pub async fn reconcile(&self) -> Result<ReconcileReport, JobError> {
        let since = self.clock.now() - chrono_duration(self.window);
        let pending = self
            .ledger
            .list_by_status(&[JobStatus::Queued, JobStatus::Started], Some(since), None)
            .await?;

        let mut report = ReconcileReport {
            scanned: pending.len(),
            ..Default::default()
        };
        for job in pending {
            let reference = job.reference();
            let present = match self.broker.contains(&reference).await {
                Ok(present) => present,
                Err(e) => {
                    tracing::error!(job_id = %job.id, lane = %job.lane, error = %e, "could not inspect lane");
                    report.failed += 1;
                    continue;
                }
            };
            if present {
                report.already_present += 1;
                continue;
            }
            match self.broker.push(reference).await {
                Ok(()) => {
                    tracing::info!(job_id = %job.id, lane = %job.lane, status = %job.status(), "re-enqueued lost job");
                    report.requeued += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, lane = %job.lane, error = %e, "could not re-enqueue job");
                    report.failed += 1;
                }
            }
        }

        let span = Span::current();
        span.record("scanned", report.scanned);
        span.record("requeued", report.requeued);
        span.record("already_present", report.already_present);
        span.record("failed", report.failed);
        Ok(report)
    }
}
