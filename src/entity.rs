//! The durable job record and the state machine it moves through.

use chrono::{DateTime, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use std::{borrow::Cow, fmt, str::FromStr};

use crate::{JobId, broker::JobReference, error::JobError, lane::Lane, runner::JobFailure};

#[derive(Clone, Eq, Hash, PartialEq, Debug, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
/// Registry name of a job type.
///
/// Use `JobType::new` for static name registration.
///
/// # Examples
///
/// ```rust
/// use lane_jobs::JobType;
///
/// const SLOW_QUERY: JobType = JobType::new("SlowQuery");
/// ```
pub struct JobType(Cow<'static, str>);
impl JobType {
    pub const fn new(job_type: &'static str) -> Self {
        JobType(Cow::Borrowed(job_type))
    }

    pub fn from_owned(job_type: String) -> Self {
        JobType(Cow::Owned(job_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        JobType::from_owned(value.to_string())
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        JobType::from_owned(value)
    }
}

impl From<&JobType> for JobType {
    fn from(value: &JobType) -> Self {
        value.clone()
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Started,
    Completed,
    FailedRetryable,
    FailedTerminal,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::Completed,
        JobStatus::FailedRetryable,
        JobStatus::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Started => "STARTED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::FailedRetryable => "FAILED_RETRYABLE",
            JobStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::FailedTerminal)
    }

    /// Whether a worker may pick up a delivery for a record in this state.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Started)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Started, Started)
                | (Started, Completed)
                | (Started, FailedRetryable)
                | (Started, FailedTerminal)
                | (FailedRetryable, Queued)
                | (FailedTerminal, Queued)
                | (Completed, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| JobError::CouldNotDeserializeRecord(format!("unknown status '{s}'")))
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned", build_fn(error = "JobError", validate = "Self::validate"))]
/// Snapshot of a job's identity and lifecycle state, as stored in the ledger.
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub lane: Lane,
    payload: JsonValue,
    status: JobStatus,
    #[builder(default)]
    result: Option<JsonValue>,
    #[builder(default)]
    error: Option<String>,
    #[builder(default)]
    trace: Option<String>,
    #[builder(default)]
    retry_count: u32,
    #[builder(default)]
    execute_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<derive_builder::UninitializedFieldError> for JobError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        JobError::CouldNotDeserializeRecord(e.to_string())
    }
}

impl JobBuilder {
    fn validate(&self) -> Result<(), JobError> {
        if let (Some(Some(_)), Some(Some(_))) = (&self.result, &self.error) {
            return Err(JobError::CouldNotDeserializeRecord(
                "result and error are both set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Job {
    /// Rebuild a record from its stored columns.
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    /// Decode the stored payload into the job type's config struct.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn payload_json(&self) -> &JsonValue {
        &self.payload
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&JsonValue> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn execute_after(&self) -> Option<DateTime<Utc>> {
        self.execute_after
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn reference(&self) -> JobReference {
        JobReference {
            id: self.id,
            lane: self.lane.clone(),
        }
    }

    pub fn status_report(&self) -> JobStatusReport {
        JobStatusReport {
            id: self.id,
            job_type: self.job_type.clone(),
            lane: self.lane.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            retry_count: self.retry_count,
            next_retry_at: match self.status {
                JobStatus::FailedRetryable => self.execute_after,
                _ => None,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<JobStatus, JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = now;
        Ok(previous)
    }

    /// Claim the record for execution. A record already `STARTED` is a
    /// re-attempt after re-delivery.
    pub(crate) fn start(&mut self, now: DateTime<Utc>) -> Result<JobStatus, JobError> {
        let previous = self.transition(JobStatus::Started, now)?;
        self.execute_after = None;
        Ok(previous)
    }

    pub(crate) fn complete(
        &mut self,
        result: Option<JsonValue>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobError> {
        let previous = self.transition(JobStatus::Completed, now)?;
        self.result = result;
        self.error = None;
        self.trace = None;
        Ok(previous)
    }

    pub(crate) fn retry_scheduled(
        &mut self,
        failure: &JobFailure,
        execute_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobError> {
        let previous = self.transition(JobStatus::FailedRetryable, now)?;
        self.record_failure(failure);
        self.retry_count += 1;
        self.execute_after = Some(execute_after);
        Ok(previous)
    }

    pub(crate) fn errored(
        &mut self,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, JobError> {
        let previous = self.transition(JobStatus::FailedTerminal, now)?;
        self.record_failure(failure);
        self.execute_after = None;
        Ok(previous)
    }

    /// Move a retryable failure back onto the queue once its backoff elapsed.
    /// The last failure stays visible until the job completes or gives up.
    pub(crate) fn requeue_retry(&mut self, now: DateTime<Utc>) -> Result<JobStatus, JobError> {
        if self.status != JobStatus::FailedRetryable {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        let previous = self.transition(JobStatus::Queued, now)?;
        self.execute_after = None;
        Ok(previous)
    }

    /// Operator-requested re-run of a finished job.
    pub(crate) fn manual_retry(&mut self, now: DateTime<Utc>) -> Result<JobStatus, JobError> {
        if !self.status.is_terminal() {
            return Err(JobError::NotRetryable {
                id: self.id,
                status: self.status,
            });
        }
        let previous = self.transition(JobStatus::Queued, now)?;
        self.retry_count = 0;
        self.result = None;
        self.error = None;
        self.trace = None;
        self.execute_after = None;
        Ok(previous)
    }

    fn record_failure(&mut self, failure: &JobFailure) {
        self.result = None;
        self.error = Some(failure.message.clone());
        self.trace = failure.detail.clone();
    }
}

#[derive(Debug, Builder)]
#[builder(build_fn(error = "JobError"))]
/// A job about to be written to the ledger for the first time.
pub struct NewJob {
    #[builder(setter(into), default = "JobId::new()")]
    pub(super) id: JobId,
    #[builder(setter(into))]
    pub(super) job_type: JobType,
    pub(super) lane: Lane,
    #[builder(setter(custom))]
    pub(super) payload: JsonValue,
}

impl NewJob {
    pub fn builder() -> NewJobBuilder {
        NewJobBuilder::default()
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// The record as first persisted: `QUEUED` with no retries.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            job_type: self.job_type,
            lane: self.lane,
            payload: self.payload,
            status: JobStatus::Queued,
            result: None,
            error: None,
            trace: None,
            retry_count: 0,
            execute_after: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl NewJobBuilder {
    pub fn payload<C: Serialize>(&mut self, payload: C) -> Result<&mut Self, JobError> {
        let value = serde_json::to_value(payload).map_err(JobError::CouldNotSerializeConfig)?;
        self.payload = Some(normalize_payload(value)?);
        Ok(self)
    }
}

/// Payloads are argument maps. `null` (e.g. a unit config) is stored as `{}`.
pub(crate) fn normalize_payload(value: JsonValue) -> Result<JsonValue, JobError> {
    match value {
        JsonValue::Null => Ok(JsonValue::Object(Default::default())),
        JsonValue::Object(_) => Ok(value),
        other => Err(JobError::InvalidPayload(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
/// What a status query returns for one job.
pub struct JobStatusReport {
    pub id: JobId,
    pub job_type: JobType,
    pub lane: Lane,
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job() -> Job {
        NewJob::builder()
            .job_type("SlowQuery")
            .lane(Lane::new("medium").unwrap())
            .payload(serde_json::json!({ "duration": 2 }))
            .unwrap()
            .build()
            .unwrap()
            .into_job(Utc::now())
    }

    #[test]
    fn new_job_starts_queued_without_retries() {
        let job = queued_job();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.retry_count(), 0);
        assert!(job.result().is_none());
        assert!(job.error().is_none());
        assert_eq!(job.created_at(), job.updated_at());
    }

    #[test]
    fn completion_clears_earlier_failure() {
        let mut job = queued_job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.retry_scheduled(&JobFailure::new("boom"), now, now).unwrap();
        assert_eq!(job.error(), Some("boom"));
        job.requeue_retry(now).unwrap();
        assert_eq!(job.error(), Some("boom"));
        job.start(now).unwrap();
        job.complete(Some(serde_json::json!("done")), now).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.retry_count(), 1);
        assert!(job.error().is_none());
        assert!(job.trace().is_none());
    }

    #[test]
    fn started_can_be_reclaimed() {
        let mut job = queued_job();
        let now = Utc::now();
        assert_eq!(job.start(now).unwrap(), JobStatus::Queued);
        assert_eq!(job.start(now).unwrap(), JobStatus::Started);
    }

    #[test]
    fn terminal_states_do_not_move_automatically() {
        let mut job = queued_job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.errored(&JobFailure::new("gave up"), now).unwrap();
        assert!(matches!(
            job.start(now),
            Err(JobError::InvalidTransition { .. })
        ));
        assert!(matches!(
            job.requeue_retry(now),
            Err(JobError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn manual_retry_resets_counters() {
        let mut job = queued_job();
        let now = Utc::now();
        job.start(now).unwrap();
        job.retry_scheduled(&JobFailure::new("a"), now, now).unwrap();
        job.requeue_retry(now).unwrap();
        job.start(now).unwrap();
        job.errored(&JobFailure::new("b").with_detail("trace"), now)
            .unwrap();
        assert_eq!(job.trace(), Some("trace"));

        job.manual_retry(now).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.retry_count(), 0);
        assert!(job.error().is_none());
        assert!(job.trace().is_none());
    }

    #[test]
    fn manual_retry_of_pending_job_is_rejected() {
        let mut job = queued_job();
        assert!(matches!(
            job.manual_retry(Utc::now()),
            Err(JobError::NotRetryable {
                status: JobStatus::Queued,
                ..
            })
        ));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(normalize_payload(serde_json::json!([1, 2])).is_err());
        assert_eq!(
            normalize_payload(JsonValue::Null).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }
}
