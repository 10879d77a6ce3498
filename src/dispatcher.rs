use futures::FutureExt;
use tracing::{Span, instrument};

use std::{panic::AssertUnwindSafe, sync::Arc};

use super::{
    broker::JobReference,
    entity::{Job, JobStatus},
    error::JobError,
    ledger::JobLedger,
    registry::JobRegistry,
    runner::*,
    time::{ClockHandle, chrono_duration},
    tracker::JobTracker,
};

/// How a single delivery ended, as far as the ledger is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conclusion {
    Completed,
    RetryScheduled,
    Errored,
    /// The reference pointed at a record that does not exist.
    Diverged,
    /// The record was not in a runnable state or was claimed concurrently.
    Skipped,
}

/// Executes one broker delivery: claim the record, run the job, store the outcome.
pub(crate) struct JobDispatcher {
    ledger: Arc<dyn JobLedger>,
    registry: JobRegistry,
    clock: ClockHandle,
    tracker: Option<Arc<JobTracker>>,
}

impl JobDispatcher {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        registry: JobRegistry,
        clock: ClockHandle,
        tracker: Option<Arc<JobTracker>>,
    ) -> Self {
        if let Some(tracker) = &tracker {
            tracker.dispatch_job();
        }
        Self {
            ledger,
            registry,
            clock,
            tracker,
        }
    }

    #[instrument(name = "job.execute_job", skip_all,
        fields(job_id = %reference.id, lane = %reference.lane, job_type, attempt, error, error.message, conclusion),
    err)]
    pub async fn execute_job(self, reference: JobReference) -> Result<Conclusion, JobError> {
        let span = Span::current();
        let Some(mut job) = self.ledger.maybe_find_by_id(reference.id).await? else {
            tracing::error!(
                job_id = %reference.id,
                lane = %reference.lane,
                "delivered reference has no ledger record; dropping delivery"
            );
            span.record("conclusion", "Diverged");
            return Ok(Conclusion::Diverged);
        };
        span.record("job_type", tracing::field::display(&job.job_type));
        span.record("attempt", job.retry_count() + 1);

        if !job.status().is_pending() {
            tracing::warn!(
                job_id = %job.id,
                status = %job.status(),
                "stale delivery for a job that is not pending; skipping"
            );
            span.record("conclusion", "Skipped");
            return Ok(Conclusion::Skipped);
        }

        let previous = job.start(self.clock.now())?;
        if previous == JobStatus::Started {
            tracing::info!(job_id = %job.id, "re-attempting job already marked started");
        }
        if let Err(e) = self.ledger.update(&job, previous).await {
            return match e {
                JobError::StaleUpdate { .. } => {
                    tracing::warn!(job_id = %job.id, "job claimed by another worker; skipping");
                    span.record("conclusion", "Skipped");
                    Ok(Conclusion::Skipped)
                }
                e => Err(e),
            };
        }

        let initialized = std::panic::catch_unwind(AssertUnwindSafe(|| self.registry.init_job(&job)));
        let outcome = match initialized {
            Ok(Ok(runner)) => Self::run_job(runner).await,
            Ok(Err(e)) => Err(JobFailure::new(e.to_string())),
            Err(panic) => Err(panic_failure(panic)),
        };

        let stored = match outcome {
            Ok(completion) => self
                .complete_job(&mut job, completion)
                .await
                .map(|()| Conclusion::Completed),
            Err(failure) => {
                span.record("error", true);
                span.record("error.message", tracing::field::display(&failure.message));
                self.fail_job(&mut job, failure).await
            }
        };
        let conclusion = match stored {
            Ok(conclusion) => conclusion,
            Err(JobError::StaleUpdate { .. }) => {
                tracing::warn!(job_id = %job.id, "record moved while the job ran; outcome dropped");
                Conclusion::Skipped
            }
            Err(e) => return Err(e),
        };
        span.record("conclusion", tracing::field::debug(conclusion));
        Ok(conclusion)
    }

    async fn run_job(runner: Box<dyn JobRunner>) -> Result<JobCompletion, JobFailure> {
        match AssertUnwindSafe(runner.run()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panic_failure(panic)),
        }
    }

    #[instrument(name = "job.complete_job", skip_all, fields(job_id = %job.id))]
    async fn complete_job(&self, job: &mut Job, completion: JobCompletion) -> Result<(), JobError> {
        job.complete(completion.into_result(), self.clock.now())?;
        self.ledger.update(job, JobStatus::Started).await
    }

    #[instrument(name = "job.fail_job", skip_all, fields(job_id = %job.id, retry_count = job.retry_count(), will_retry = tracing::field::Empty))]
    async fn fail_job(&self, job: &mut Job, failure: JobFailure) -> Result<Conclusion, JobError> {
        let retry_settings = self.registry.retry_settings(&job.job_type);
        let now = self.clock.now();
        let conclusion = if retry_settings.should_retry(job.retry_count()) {
            Span::current().record("will_retry", true);
            let delay = retry_settings.next_delay(job.retry_count());
            let execute_after = now + chrono_duration(delay);
            job.retry_scheduled(&failure, execute_after, now)?;
            tracing::warn!(
                job_id = %job.id,
                retry_count = job.retry_count(),
                execute_after = %execute_after,
                error = %failure,
                "job failed; retry scheduled"
            );
            Conclusion::RetryScheduled
        } else {
            Span::current().record("will_retry", false);
            job.errored(&failure, now)?;
            tracing::error!(
                job_id = %job.id,
                retry_count = job.retry_count(),
                error = %failure,
                "job failed; retries exhausted"
            );
            Conclusion::Errored
        };
        self.ledger.update(job, JobStatus::Started).await?;
        Ok(conclusion)
    }
}

fn panic_failure(panic: Box<dyn std::any::Any + Send>) -> JobFailure {
    let message = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    tracing::error!(
        target: "job.panic",
        panic_message = %message,
        "Job panicked during execution"
    );

    JobFailure::new(format!("Job panicked: {message}"))
        .with_detail(std::backtrace::Backtrace::force_capture().to_string())
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.job_completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        entity::{JobType, NewJob},
        lane::Lane,
        ledger::InMemoryJobLedger,
        time::Clock,
    };

    struct PanickingInitializer;

    impl JobInitializer for PanickingInitializer {
        type Config = ();

        fn job_type(&self) -> JobType {
            JobType::new("Panics")
        }

        fn retry_settings(&self) -> RetrySettings {
            RetrySettings::no_retries()
        }

        fn init(&self, _: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
            Ok(Box::new(PanickingRunner))
        }
    }

    struct PanickingRunner;

    struct PanickingInitInitializer;

    impl JobInitializer for PanickingInitInitializer {
        type Config = ();

        fn job_type(&self) -> JobType {
            JobType::new("PanicsInInit")
        }

        fn retry_settings(&self) -> RetrySettings {
            RetrySettings::no_retries()
        }

        fn init(&self, _: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
            panic!("bad payload shape")
        }
    }

    #[async_trait]
    impl JobRunner for PanickingRunner {
        async fn run(&self) -> Result<JobCompletion, JobFailure> {
            panic!("index out of bounds")
        }
    }

    async fn setup() -> (Arc<InMemoryJobLedger>, JobRegistry, Job) {
        let ledger = Arc::new(InMemoryJobLedger::new());
        let registry = JobRegistry::new();
        registry.add_initializer(PanickingInitializer);
        let job = NewJob::builder()
            .job_type("Panics")
            .lane(Lane::new("low").unwrap())
            .payload(())
            .unwrap()
            .build()
            .unwrap()
            .into_job(chrono::Utc::now());
        ledger.insert(&job).await.unwrap();
        (ledger, registry, job)
    }

    #[tokio::test]
    async fn panics_are_recorded_as_failures() -> Result<(), JobError> {
        let (ledger, registry, job) = setup().await;
        let conclusion = JobDispatcher::new(ledger.clone(), registry, Clock::handle().clone(), None)
            .execute_job(job.reference())
            .await?;
        assert_eq!(conclusion, Conclusion::Errored);

        let stored = ledger.find_by_id(job.id).await?;
        assert_eq!(stored.status(), JobStatus::FailedTerminal);
        assert!(stored.error().unwrap().contains("index out of bounds"));
        assert!(stored.trace().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn panics_in_init_are_recorded_as_failures() -> Result<(), JobError> {
        let (ledger, registry, _) = setup().await;
        registry.add_initializer(PanickingInitInitializer);
        let job = NewJob::builder()
            .job_type("PanicsInInit")
            .lane(Lane::new("low").unwrap())
            .payload(())
            .unwrap()
            .build()
            .unwrap()
            .into_job(chrono::Utc::now());
        ledger.insert(&job).await?;

        let dispatcher = JobDispatcher::new(ledger.clone(), registry, Clock::handle().clone(), None);
        let conclusion = tokio::spawn(dispatcher.execute_job(job.reference()))
            .await
            .expect("dispatcher task must not panic")?;
        assert_eq!(conclusion, Conclusion::Errored);

        let stored = ledger.find_by_id(job.id).await?;
        assert_eq!(stored.status(), JobStatus::FailedTerminal);
        assert!(stored.error().unwrap().contains("bad payload shape"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_record_is_dropped() -> Result<(), JobError> {
        let (ledger, registry, _) = setup().await;
        let reference = JobReference {
            id: crate::JobId::new(),
            lane: Lane::new("low").unwrap(),
        };
        let conclusion = JobDispatcher::new(ledger, registry, Clock::handle().clone(), None)
            .execute_job(reference)
            .await?;
        assert_eq!(conclusion, Conclusion::Diverged);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_delivery_of_finished_job_is_skipped() -> Result<(), JobError> {
        let (ledger, registry, job) = setup().await;
        let clock = Clock::handle().clone();
        JobDispatcher::new(ledger.clone(), registry.clone(), clock.clone(), None)
            .execute_job(job.reference())
            .await?;
        let again = JobDispatcher::new(ledger.clone(), registry, clock, None)
            .execute_job(job.reference())
            .await?;
        assert_eq!(again, Conclusion::Skipped);
        assert_eq!(
            ledger.find_by_id(job.id).await?.status(),
            JobStatus::FailedTerminal
        );
        Ok(())
    }
}
