#![allow(dead_code)]

use async_trait::async_trait;
use lane_jobs::{
    ClockHandle, Job, JobCompletion, JobFailure, JobId, JobInitializer, JobPollerConfig,
    JobRunner, JobStatusReport, JobSvcConfig, JobType, Jobs, RetrySettings,
    broker::{BrokerError, InMemoryBroker, JobBroker, JobReference},
    ledger::{InMemoryJobLedger, JobLedger},
};
use serde::{Deserialize, Serialize};

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

pub async fn init_pool() -> anyhow::Result<sqlx::PgPool> {
    let pg_host = std::env::var("PG_HOST").unwrap_or("localhost".to_string());
    let pg_con = std::env::var("DATABASE_URL")
        .unwrap_or(format!("postgres://user:password@{pg_host}:5432/pg"));
    let pool = sqlx::PgPool::connect(&pg_con).await?;
    Ok(pool)
}

pub fn poller_config() -> JobPollerConfig {
    JobPollerConfig {
        poll_timeout: Duration::from_millis(50),
        retry_sweep_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

/// In-memory service config sharing `ledger` and `broker`, so a second
/// service built from them behaves like a restarted process.
pub fn in_memory_config(
    ledger: Arc<dyn JobLedger>,
    broker: Arc<dyn JobBroker>,
    clock: ClockHandle,
    poller_config: JobPollerConfig,
) -> JobSvcConfig {
    JobSvcConfig::builder()
        .ledger(ledger)
        .broker(broker)
        .clock(clock)
        .poller_config(poller_config)
        .build()
        .expect("in-memory config")
}

pub fn in_memory_parts() -> (Arc<InMemoryJobLedger>, Arc<InMemoryBroker>) {
    (
        Arc::new(InMemoryJobLedger::new()),
        Arc::new(InMemoryBroker::default()),
    )
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the job's status report satisfies `pred`, returning that report.
pub async fn wait_until<P>(jobs: &Jobs, id: JobId, pred: P) -> anyhow::Result<JobStatusReport>
where
    P: Fn(&JobStatusReport) -> bool,
{
    let pred = &pred;
    wait_for(move || async move { Ok(pred(&jobs.get_status(id).await?)) }).await?;
    Ok(jobs.get_status(id).await?)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlowQueryConfig {
    pub duration_ms: u64,
    pub rows: u64,
}

pub struct SlowQueryInitializer;

impl JobInitializer for SlowQueryInitializer {
    type Config = SlowQueryConfig;

    fn job_type(&self) -> JobType {
        JobType::new("SlowQuery")
    }

    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
        Ok(Box::new(SlowQueryRunner {
            config: job.payload()?,
        }))
    }
}

struct SlowQueryRunner {
    config: SlowQueryConfig,
}

#[async_trait]
impl JobRunner for SlowQueryRunner {
    async fn run(&self) -> Result<JobCompletion, JobFailure> {
        tokio::time::sleep(Duration::from_millis(self.config.duration_ms)).await;
        JobCompletion::with_result(serde_json::json!({ "rows": self.config.rows }))
    }
}

/// Fails until `healthy` is set.
pub struct FailedJobInitializer {
    pub healthy: Arc<AtomicBool>,
    pub retry_settings: RetrySettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailedJobConfig {
    pub table: String,
}

impl JobInitializer for FailedJobInitializer {
    type Config = FailedJobConfig;

    fn job_type(&self) -> JobType {
        JobType::new("FailedJob")
    }

    fn retry_settings(&self) -> RetrySettings {
        self.retry_settings.clone()
    }

    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
        let config: FailedJobConfig = job.payload()?;
        Ok(Box::new(FailedJobRunner {
            table: config.table,
            healthy: Arc::clone(&self.healthy),
        }))
    }
}

struct FailedJobRunner {
    table: String,
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl JobRunner for FailedJobRunner {
    async fn run(&self) -> Result<JobCompletion, JobFailure> {
        if self.healthy.load(Ordering::SeqCst) {
            return Ok(JobCompletion::Complete);
        }
        Err(JobFailure::new(format!("relation \"{}\" does not exist", self.table))
            .with_detail("at FailedJobRunner::run"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub label: String,
}

/// Appends each run's label to `log`, for asserting execution order.
pub struct RecordingInitializer {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl JobInitializer for RecordingInitializer {
    type Config = RecordingConfig;

    fn job_type(&self) -> JobType {
        JobType::new("Recording")
    }

    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
        let config: RecordingConfig = job.payload()?;
        Ok(Box::new(RecordingRunner {
            label: config.label,
            log: Arc::clone(&self.log),
        }))
    }
}

struct RecordingRunner {
    label: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn run(&self) -> Result<JobCompletion, JobFailure> {
        self.log.lock().unwrap().push(self.label.clone());
        Ok(JobCompletion::Complete)
    }
}

/// Hangs on its first run only, to simulate a worker dying mid-job.
pub struct HangOnceInitializer {
    pub hung: Arc<AtomicBool>,
}

impl JobInitializer for HangOnceInitializer {
    type Config = ();

    fn job_type(&self) -> JobType {
        JobType::new("HangOnce")
    }

    fn init(&self, _: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
        Ok(Box::new(HangOnceRunner {
            hung: Arc::clone(&self.hung),
        }))
    }
}

struct HangOnceRunner {
    hung: Arc<AtomicBool>,
}

#[async_trait]
impl JobRunner for HangOnceRunner {
    async fn run(&self) -> Result<JobCompletion, JobFailure> {
        if !self.hung.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(JobCompletion::Complete)
    }
}

/// Wraps a broker and rejects every call while `down` is set.
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    pub down: AtomicBool,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self {
            inner: InMemoryBroker::default(),
            down: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobBroker for FlakyBroker {
    async fn push(&self, reference: JobReference) -> Result<(), BrokerError> {
        self.check()?;
        self.inner.push(reference).await
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobReference>, BrokerError> {
        self.check()?;
        self.inner.pop(timeout).await
    }

    async fn contains(&self, reference: &JobReference) -> Result<bool, BrokerError> {
        self.check()?;
        self.inner.contains(reference).await
    }
}
