use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use std::collections::HashMap;

use super::JobLedger;
use crate::{
    JobId,
    entity::{Job, JobStatus},
    error::JobError,
};

#[derive(Default)]
/// Ledger kept in process memory. Useful for tests and single-process setups
/// that can afford to lose history on exit.
pub struct InMemoryJobLedger {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn oldest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl JobLedger for InMemoryJobLedger {
    async fn insert(&self, job: &Job) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateId(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn maybe_find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            None => Err(JobError::NotFound(job.id)),
            Some(stored) if stored.status() != expected => Err(JobError::StaleUpdate {
                id: job.id,
                expected,
            }),
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
        }
    }

    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        created_after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobError> {
        let mut matching: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| statuses.contains(&job.status()))
            .filter(|job| created_after.is_none_or(|after| job.created_at() > after))
            .cloned()
            .collect();
        oldest_first(&mut matching);
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        let mut due: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status() == JobStatus::FailedRetryable)
            .filter(|job| job.execute_after().is_none_or(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|job| (job.execute_after(), job.id));
        due.truncate(limit);
        Ok(due)
    }
}
