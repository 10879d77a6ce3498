use tracing::{Span, instrument};

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::{
    config::JobPollerConfig, dispatcher::*, error::JobError, handle::OwnedTaskHandle,
    registry::JobRegistry, spawner::JobEnqueuer, tracker::JobTracker,
};

const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(30);

/// Pulls references off the broker and runs them, one task per delivery.
pub(crate) struct JobPoller {
    config: JobPollerConfig,
    enqueuer: JobEnqueuer,
    registry: JobRegistry,
    tracker: Arc<JobTracker>,
    instance_id: uuid::Uuid,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub(crate) struct JobPollerHandle {
    #[allow(dead_code)]
    poller: Arc<JobPoller>,
    handle: tokio::sync::Mutex<Option<OwnedTaskHandle>>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    shutdown_called: Arc<AtomicBool>,
    tracker: Arc<JobTracker>,
    shutdown_timeout: Duration,
}

fn failure_backoff(failures: u32) -> Duration {
    Duration::from_millis(50u64.saturating_mul(1 << failures.min(16))).min(MAX_FAILURE_BACKOFF)
}

impl JobPoller {
    pub fn new(config: JobPollerConfig, enqueuer: JobEnqueuer, registry: JobRegistry) -> Self {
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        Self {
            tracker: Arc::new(JobTracker::new(config.max_jobs_per_process)),
            enqueuer,
            config,
            registry,
            instance_id: uuid::Uuid::now_v7(),
            shutdown_tx,
        }
    }

    pub fn start(self) -> JobPollerHandle {
        let sweeper_handle = self.start_retry_sweeper();
        let shutdown_tx = self.shutdown_tx.clone();
        let tracker = Arc::clone(&self.tracker);
        let shutdown_timeout = self.config.shutdown_timeout;
        let poller = Arc::new(self);
        let handle = OwnedTaskHandle::new(tokio::task::spawn(Self::main_loop(
            Arc::clone(&poller),
            sweeper_handle,
        )));
        JobPollerHandle {
            poller,
            handle: tokio::sync::Mutex::new(Some(handle)),
            shutdown_tx,
            shutdown_called: Arc::new(AtomicBool::new(false)),
            tracker,
            shutdown_timeout,
        }
    }

    async fn main_loop(self: Arc<Self>, _sweeper_task: OwnedTaskHandle) {
        let mut failures = 0;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(poller_id = %self.instance_id, "job poller started");

        loop {
            if !self.tracker.has_capacity() {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::timeout(self.config.poll_timeout, self.tracker.notified()) => {}
                }
                continue;
            }

            let delay = tokio::select! {
                biased;

                _ = shutdown_rx.recv() => break,
                result = self.poll_and_dispatch() => match result {
                    Ok(()) => {
                        failures = 0;
                        None
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::error!(error = %e, failures, "main loop error");
                        Some(failure_backoff(failures))
                    }
                },
            };

            if let Some(delay) = delay {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    _ = self.enqueuer.clock().sleep(delay) => {}
                }
            }
        }
        tracing::info!(poller_id = %self.instance_id, "job poller stopped");
    }

    #[instrument(
        name = "job.poll_and_dispatch",
        level = "debug",
        skip(self),
        fields(poller_id = %self.instance_id, n_jobs_running = self.tracker.n_running(), job_id),
        err
    )]
    async fn poll_and_dispatch(self: &Arc<Self>) -> Result<(), JobError> {
        let Some(reference) = self
            .enqueuer
            .broker()
            .pop(self.config.poll_timeout)
            .await?
        else {
            return Ok(());
        };
        Span::current().record("job_id", tracing::field::display(reference.id));

        let dispatcher = JobDispatcher::new(
            Arc::clone(self.enqueuer.ledger()),
            self.registry.clone(),
            self.enqueuer.clock().clone(),
            Some(Arc::clone(&self.tracker)),
        );
        let job_handle = tokio::spawn(async move {
            let id = reference.id;
            if let Err(e) = dispatcher.execute_job(reference).await {
                tracing::error!(job_id = %id, error = %e, "job dispatcher error");
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let abort_handle = job_handle.abort_handle();
        let grace = self.config.shutdown_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = job_handle => {}
                res = shutdown_rx.recv() => {
                    if res.is_ok() {
                        tokio::time::sleep(grace).await;
                        abort_handle.abort();
                    }
                }
            }
        });

        Ok(())
    }

    fn start_retry_sweeper(&self) -> OwnedTaskHandle {
        let interval = self.config.retry_sweep_interval;
        let batch_size = self.config.retry_sweep_batch_size;
        let enqueuer = self.enqueuer.clone();
        OwnedTaskHandle::new(tokio::task::spawn(async move {
            let mut failures = 0;
            loop {
                let delay = match enqueuer.requeue_due_retries(batch_size).await {
                    Ok(n) if n > 0 && n == batch_size => {
                        failures = 0;
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Ok(_) => {
                        failures = 0;
                        interval
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::error!(error = %e, failures, "retry sweep error");
                        failure_backoff(failures).max(interval)
                    }
                };
                enqueuer.clock().sleep(delay).await;
            }
        }))
    }
}

impl JobPollerHandle {
    /// Stop polling and wait for in-flight jobs.
    ///
    /// Idempotent. Jobs still running after `shutdown_timeout` are aborted;
    /// their records stay `STARTED` and are re-enqueued by the reconciler on
    /// the next start.
    #[instrument(name = "job.poller_shutdown", skip(self), fields(n_jobs_running), err)]
    pub async fn shutdown(&self) -> Result<(), JobError> {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop().await;
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        while self.tracker.n_running() > 0 && tokio::time::Instant::now() < deadline {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.tracker.notified()).await;
        }
        Span::current().record("n_jobs_running", self.tracker.n_running());
        if self.tracker.n_running() > 0 {
            tracing::warn!(
                n_jobs_running = self.tracker.n_running(),
                "shutdown timeout elapsed with jobs still running; they will be recovered on restart"
            );
        }
        Ok(())
    }
}

impl Drop for JobPollerHandle {
    fn drop(&mut self) {
        if !self.shutdown_called.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
        }
    }
}
