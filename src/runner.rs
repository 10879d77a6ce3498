//! Traits and types used when defining job logic.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use std::{fmt, time::Duration};

use super::{
    entity::{Job, JobType},
    error::JobError,
};

/// Describes how to construct a [`JobRunner`] for a given job type.
pub trait JobInitializer: Send + Sync + 'static {
    /// The constructor arguments persisted as the job's payload.
    type Config: Serialize + DeserializeOwned + Send + Sync;

    /// Returns the unique registry name of the job type.
    ///
    /// ```ignore
    /// fn job_type(&self) -> JobType {
    ///     JobType::new("SlowQuery")
    /// }
    /// ```
    fn job_type(&self) -> JobType;

    /// Retry settings to use when the runner fails.
    fn retry_settings(&self) -> RetrySettings {
        Default::default()
    }

    /// Reconstruct a runnable instance from the persisted record.
    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>>;
}

/// Value returned by a successful [`JobRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobCompletion {
    /// Job finished without a result worth storing.
    Complete,
    /// Job finished; the value is stored on the record.
    CompleteWithResult(JsonValue),
}

impl JobCompletion {
    pub fn with_result<T: Serialize>(value: T) -> Result<Self, JobFailure> {
        Ok(JobCompletion::CompleteWithResult(serde_json::to_value(
            value,
        )?))
    }

    pub(crate) fn into_result(self) -> Option<JsonValue> {
        match self {
            JobCompletion::Complete => None,
            JobCompletion::CompleteWithResult(value) => Some(value),
        }
    }
}

#[async_trait]
/// Implemented by job executors that perform the actual work.
///
/// All inputs are captured when the initializer builds the runner, so `run`
/// takes no arguments. A run may happen more than once for the same job.
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self) -> Result<JobCompletion, JobFailure>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why a run failed. `message` is shown in status queries, `detail` is kept on
/// the record for diagnostics.
pub struct JobFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for JobFailure
where
    E: std::error::Error,
{
    fn from(error: E) -> Self {
        let mut detail = format!("{error:?}");
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push_str(&format!("\ncaused by: {cause}"));
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            detail: Some(detail),
        }
    }
}

/// Longest delay a retry may be scheduled with.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5200 * 7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
/// Delay before the n-th retry becomes eligible to run.
///
/// Built through [`Backoff::schedule`] or [`Backoff::exponential`], both of
/// which reject non-increasing delays.
pub struct Backoff {
    kind: BackoffKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    /// Fixed table indexed by retry number. Retries past the end of the table
    /// keep doubling the last entry.
    Schedule(Vec<Duration>),
    /// `base * factor^(n - 1)`.
    Exponential { base: Duration, factor: u32 },
}

impl Backoff {
    /// Build a table backoff. Entries must be non-zero and strictly increasing.
    pub fn schedule(intervals: impl IntoIterator<Item = Duration>) -> Result<Self, JobError> {
        let intervals: Vec<Duration> = intervals.into_iter().collect();
        if intervals.is_empty() || intervals[0].is_zero() {
            return Err(JobError::Config(
                "backoff schedule needs at least one non-zero interval".to_string(),
            ));
        }
        if intervals.windows(2).any(|w| w[0] >= w[1]) {
            return Err(JobError::Config(
                "backoff schedule must be strictly increasing".to_string(),
            ));
        }
        Ok(Self {
            kind: BackoffKind::Schedule(intervals),
        })
    }

    pub fn exponential(base: Duration, factor: u32) -> Result<Self, JobError> {
        if base.is_zero() || factor < 2 {
            return Err(JobError::Config(
                "exponential backoff needs a non-zero base and a factor of at least 2".to_string(),
            ));
        }
        Ok(Self {
            kind: BackoffKind::Exponential { base, factor },
        })
    }

    /// Delay before retry number `retry` (1-based). Saturates at `Duration::MAX`.
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match &self.kind {
            BackoffKind::Schedule(intervals) => {
                let idx = (retry - 1) as usize;
                match intervals.get(idx) {
                    Some(d) => *d,
                    None => {
                        let last = intervals.last().copied().unwrap_or(Duration::from_secs(60));
                        let extra = (idx + 1 - intervals.len()) as u32;
                        grow(last, 2, extra)
                    }
                }
            }
            BackoffKind::Exponential { base, factor } => grow(*base, *factor, retry - 1),
        }
    }
}

/// `start * factor^times`, saturating.
fn grow(start: Duration, factor: u32, times: u32) -> Duration {
    let mut delay = start;
    for _ in 0..times {
        if delay == Duration::MAX {
            break;
        }
        delay = delay.saturating_mul(factor);
    }
    delay
}

impl Default for Backoff {
    fn default() -> Self {
        const SECS_IN_ONE_MINUTE: u64 = 60;
        Self {
            kind: BackoffKind::Schedule(vec![
                Duration::from_secs(SECS_IN_ONE_MINUTE),
                Duration::from_secs(5 * SECS_IN_ONE_MINUTE),
                Duration::from_secs(15 * SECS_IN_ONE_MINUTE),
            ]),
        }
    }
}

#[derive(Debug, Clone)]
/// Controls how many times a failing job is retried and how long each retry waits.
pub struct RetrySettings {
    max_retries: u32,
    backoff: Backoff,
}

impl RetrySettings {
    /// Failures beyond `max_retries` retries mark the job `FAILED_TERMINAL`.
    ///
    /// Rejects budgets whose last delay would exceed [`MAX_RETRY_DELAY`], past
    /// which delays could no longer grow.
    pub fn new(max_retries: u32, backoff: Backoff) -> Result<Self, JobError> {
        if max_retries > 0 && backoff.delay(max_retries) > MAX_RETRY_DELAY {
            return Err(JobError::Config(format!(
                "retry {max_retries} would wait longer than {MAX_RETRY_DELAY:?}"
            )));
        }
        Ok(Self {
            max_retries,
            backoff,
        })
    }

    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// `true` when a job that already retried `retry_count` times may retry again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn next_delay(&self, retry_count: u32) -> Duration {
        self.backoff.delay(retry_count.saturating_add(1))
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}
