//! Durable record of every job: the single source of truth for existence and
//! status.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    JobId,
    entity::{Job, JobStatus},
    error::JobError,
};

pub use memory::InMemoryJobLedger;
pub use postgres::PgJobLedger;

#[async_trait]
/// Each operation touches at most one record, atomically.
pub trait JobLedger: Send + Sync + 'static {
    /// Persist a new record. Fails with [`JobError::DuplicateId`] if the id exists.
    async fn insert(&self, job: &Job) -> Result<(), JobError>;

    async fn maybe_find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError>;

    async fn find_by_id(&self, id: JobId) -> Result<Job, JobError> {
        self.maybe_find_by_id(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    /// Write back a record whose stored status is still `expected`.
    /// Fails with [`JobError::StaleUpdate`] when another writer moved it first.
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobError>;

    /// Records in any of `statuses`, oldest first, optionally only those
    /// created after `created_after`.
    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        created_after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobError>;

    /// `FAILED_RETRYABLE` records whose backoff has elapsed at `now`.
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobError>;
}
