//! Operator actions on jobs that gave up.

use serde::Serialize;
use tracing::{Span, instrument};

use super::{
    JobId,
    entity::{Job, JobStatus},
    error::JobError,
    ledger::JobLedger,
    spawner::JobEnqueuer,
};

/// Outcome of [`Jobs::retry_all_failed`](crate::Jobs::retry_all_failed).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryAllReport {
    pub retried: Vec<JobId>,
    /// Jobs that could not be retried, with the reason.
    pub failed: Vec<(JobId, String)>,
}

#[instrument(name = "job.list_failed", skip(enqueuer), err)]
pub(crate) async fn list_failed(
    enqueuer: &JobEnqueuer,
    limit: Option<usize>,
) -> Result<Vec<Job>, JobError> {
    enqueuer
        .ledger()
        .list_by_status(&[JobStatus::FailedTerminal], None, limit)
        .await
}

/// Reset a finished job to `QUEUED` with a fresh retry budget and put it back
/// on its lane under the same id.
#[instrument(name = "job.retry_failed", skip(enqueuer), fields(previous_status), err)]
pub(crate) async fn retry_failed(enqueuer: &JobEnqueuer, id: JobId) -> Result<Job, JobError> {
    let mut job = enqueuer.ledger().find_by_id(id).await?;
    let previous = job.manual_retry(enqueuer.clock().now())?;
    Span::current().record("previous_status", previous.as_str());
    enqueuer.ledger().update(&job, previous).await?;
    enqueuer.enqueue(&job).await;
    tracing::info!(job_id = %id, previous_status = %previous, lane = %job.lane, "job manually retried");
    Ok(job)
}

#[instrument(name = "job.retry_all_failed", skip(enqueuer), fields(n_retried, n_failed), err)]
pub(crate) async fn retry_all_failed(enqueuer: &JobEnqueuer) -> Result<RetryAllReport, JobError> {
    let mut report = RetryAllReport::default();
    for job in list_failed(enqueuer, None).await? {
        match retry_failed(enqueuer, job.id).await {
            Ok(_) => report.retried.push(job.id),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "could not retry job");
                report.failed.push((job.id, e.to_string()));
            }
        }
    }
    Span::current().record("n_retried", report.retried.len());
    Span::current().record("n_failed", report.failed.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        broker::{InMemoryBroker, JobBroker},
        entity::{JobType, NewJob},
        lane::Lane,
        ledger::InMemoryJobLedger,
        registry::JobRegistry,
        runner::JobFailure,
        time::ClockHandle,
    };

    async fn setup() -> (JobEnqueuer, Arc<InMemoryBroker>, Job) {
        let ledger = Arc::new(InMemoryJobLedger::new());
        let broker = Arc::new(InMemoryBroker::default());
        let clock = ClockHandle::realtime();
        let mut job = NewJob::builder()
            .job_type(JobType::new("Flaky"))
            .lane(Lane::new("medium").unwrap())
            .payload(serde_json::json!({ "attempts": 4 }))
            .unwrap()
            .build()
            .unwrap()
            .into_job(clock.now());
        job.start(clock.now()).unwrap();
        job.errored(&JobFailure::new("boom"), clock.now()).unwrap();
        ledger.insert(&job).await.unwrap();
        let enqueuer = JobEnqueuer::new(ledger, broker.clone(), JobRegistry::new(), clock);
        (enqueuer, broker, job)
    }

    #[tokio::test]
    async fn retry_resets_the_record_and_requeues() -> Result<(), JobError> {
        let (enqueuer, broker, job) = setup().await;
        assert_eq!(list_failed(&enqueuer, Some(10)).await?.len(), 1);

        let retried = retry_failed(&enqueuer, job.id).await?;
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.status(), JobStatus::Queued);
        assert_eq!(retried.retry_count(), 0);
        assert_eq!(retried.error(), None);
        assert_eq!(retried.payload_json(), job.payload_json());
        assert!(broker.contains(&job.reference()).await?);
        assert!(list_failed(&enqueuer, None).await?.is_empty());

        let again = retry_failed(&enqueuer, job.id).await;
        assert!(matches!(
            again,
            Err(JobError::NotRetryable {
                status: JobStatus::Queued,
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let (enqueuer, _, _) = setup().await;
        assert!(matches!(
            retry_failed(&enqueuer, JobId::new()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn retry_all_reports_each_job() -> Result<(), JobError> {
        let (enqueuer, broker, job) = setup().await;
        let report = retry_all_failed(&enqueuer).await?;
        assert_eq!(report.retried, vec![job.id]);
        assert!(report.failed.is_empty());
        assert_eq!(broker.total_len().await, 1);
        assert_eq!(
            enqueuer.ledger().find_by_id(job.id).await?.status(),
            JobStatus::Queued
        );
        Ok(())
    }
}
