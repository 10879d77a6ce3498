//! Dispatching jobs: write the ledger record, then hand a reference to the broker.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{Span, instrument};

use std::{marker::PhantomData, sync::Arc};

use super::{
    JobId,
    broker::JobBroker,
    entity::{Job, JobStatus, JobType, NewJob, normalize_payload},
    error::JobError,
    lane::Lane,
    ledger::JobLedger,
    registry::JobRegistry,
    time::ClockHandle,
};

#[derive(Clone)]
/// Shared write path into the ledger and broker, used for first dispatch,
/// backoff re-queues and manual retries alike.
pub(crate) struct JobEnqueuer {
    ledger: Arc<dyn JobLedger>,
    broker: Arc<dyn JobBroker>,
    registry: JobRegistry,
    clock: ClockHandle,
}

impl JobEnqueuer {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        broker: Arc<dyn JobBroker>,
        registry: JobRegistry,
        clock: ClockHandle,
    ) -> Self {
        Self {
            ledger,
            broker,
            registry,
            clock,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }

    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }

    #[instrument(
        name = "job.dispatch",
        skip(self, payload),
        fields(job_type = %job_type, lane = lane, job_id = tracing::field::Empty),
        err
    )]
    pub async fn dispatch(
        &self,
        job_type: JobType,
        payload: JsonValue,
        lane: &str,
    ) -> Result<Job, JobError> {
        if !self.registry.is_registered(&job_type) {
            return Err(JobError::UnknownJobType(job_type));
        }
        let lane = Lane::new(lane)?;
        let new_job = NewJob::builder()
            .job_type(job_type)
            .lane(lane)
            .payload(normalize_payload(payload)?)?
            .build()?;
        Span::current().record("job_id", tracing::field::display(new_job.id()));

        let job = new_job.into_job(self.clock.now());
        self.ledger.insert(&job).await?;
        self.enqueue(&job).await;
        Ok(job)
    }

    /// Push the job's reference onto its lane. A broker failure is logged, not
    /// returned: the record is durable and the reconciler re-enqueues it.
    #[instrument(name = "job.enqueue", skip_all, fields(job_id = %job.id, lane = %job.lane, enqueued))]
    pub async fn enqueue(&self, job: &Job) -> bool {
        match self.broker.push(job.reference()).await {
            Ok(()) => {
                Span::current().record("enqueued", true);
                true
            }
            Err(e) => {
                Span::current().record("enqueued", false);
                tracing::error!(
                    job_id = %job.id,
                    lane = %job.lane,
                    error = %e,
                    "broker push failed; job stays {} in the ledger until reconciled",
                    job.status()
                );
                false
            }
        }
    }

    /// Move every `FAILED_RETRYABLE` record whose backoff has elapsed back to
    /// `QUEUED` and onto its original lane. Returns how many were re-queued.
    #[instrument(
        name = "job.requeue_due_retries",
        level = "debug",
        skip(self),
        fields(now, n_due = tracing::field::Empty, n_requeued = tracing::field::Empty),
        err
    )]
    pub async fn requeue_due_retries(&self, batch_size: usize) -> Result<usize, JobError> {
        let now = self.clock.now();
        Span::current().record("now", tracing::field::display(now));
        let due = self.ledger.list_due_retries(now, batch_size).await?;
        Span::current().record("n_due", due.len());

        let mut requeued = 0;
        for mut job in due {
            job.requeue_retry(now)?;
            match self.ledger.update(&job, JobStatus::FailedRetryable).await {
                Ok(()) => {}
                Err(JobError::StaleUpdate { .. }) => {
                    tracing::debug!(job_id = %job.id, "retry already re-queued elsewhere");
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.enqueue(&job).await;
            requeued += 1;
        }
        Span::current().record("n_requeued", requeued);
        Ok(requeued)
    }
}

/// A handle for dispatching jobs of a specific type.
///
/// Returned by [`crate::Jobs::add_initializer`]. The spawner encapsulates the job type
/// and serializes the typed config into the persisted payload.
///
/// # Examples
///
/// ```ignore
/// let spawner = jobs.add_initializer(SlowQueryInitializer);
/// let job = spawner.dispatch(SlowQueryConfig { duration: 2 }, "medium").await?;
/// ```
pub struct JobSpawner<Config> {
    enqueuer: JobEnqueuer,
    job_type: JobType,
    _phantom: PhantomData<fn(Config)>,
}

impl<Config> Clone for JobSpawner<Config> {
    fn clone(&self) -> Self {
        Self {
            enqueuer: self.enqueuer.clone(),
            job_type: self.job_type.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<Config> JobSpawner<Config>
where
    Config: Serialize + Send + Sync,
{
    pub(crate) fn new(enqueuer: JobEnqueuer, job_type: JobType) -> Self {
        Self {
            enqueuer,
            job_type,
            _phantom: PhantomData,
        }
    }

    /// Returns the job type this spawner creates.
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// Persist a new job and enqueue it on `lane`.
    #[instrument(
        name = "job_spawner.dispatch",
        skip(self, config),
        fields(job_type = %self.job_type),
        err
    )]
    pub async fn dispatch(&self, config: Config, lane: &str) -> Result<Job, JobError> {
        let payload = serde_json::to_value(config).map_err(JobError::CouldNotSerializeConfig)?;
        self.enqueuer
            .dispatch(self.job_type.clone(), payload, lane)
            .await
    }

    /// Like [`dispatch`](Self::dispatch) but returns only the id.
    pub async fn dispatch_id(&self, config: Config, lane: &str) -> Result<JobId, JobError> {
        self.dispatch(config, lane).await.map(|job| job.id)
    }
}
