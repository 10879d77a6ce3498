use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::instrument;

use super::JobLedger;
use crate::{
    JobId,
    entity::{Job, JobStatus, JobType},
    error::JobError,
    lane::Lane,
};

#[derive(Clone)]
/// Ledger stored in the `job_records` table. See `migrations/` for the schema.
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: JobId,
    job_type: String,
    payload: JsonValue,
    lane: String,
    status: String,
    result: Option<JsonValue>,
    error: Option<String>,
    trace: Option<String>,
    retry_count: i32,
    execute_after: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            JobError::CouldNotDeserializeRecord(format!(
                "negative retry_count {} on {}",
                row.retry_count, row.id
            ))
        })?;
        Job::builder()
            .id(row.id)
            .job_type(JobType::from_owned(row.job_type))
            .lane(Lane::new(row.lane)?)
            .payload(row.payload)
            .status(row.status.parse()?)
            .result(row.result)
            .error(row.error)
            .trace(row.trace)
            .retry_count(retry_count)
            .execute_after(row.execute_after)
            .created_at(row.created_at)
            .updated_at(row.updated_at)
            .build()
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, job_type, payload, lane, status, result, error, trace,
           retry_count, execute_after, created_at, updated_at
    FROM job_records
"#;

#[async_trait]
impl JobLedger for PgJobLedger {
    #[instrument(name = "job_ledger.insert", skip_all, fields(job_id = %job.id), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobError> {
        let res = sqlx::query(
            r#"
            INSERT INTO job_records
              (id, job_type, payload, lane, status, result, error, trace,
               retry_count, execute_after, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id)
        .bind(job.job_type.as_str())
        .bind(job.payload_json())
        .bind(job.lane.as_str())
        .bind(job.status().as_str())
        .bind(job.result())
        .bind(job.error())
        .bind(job.trace())
        .bind(job.retry_count() as i32)
        .bind(job.execute_after())
        .bind(job.created_at())
        .bind(job.updated_at())
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(JobError::DuplicateId(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(name = "job_ledger.find_by_id", skip(self), err)]
    async fn maybe_find_by_id(&self, id: JobId) -> Result<Option<Job>, JobError> {
        let row: Option<JobRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(name = "job_ledger.update", skip_all, fields(job_id = %job.id, expected = %expected, status = %job.status()), err)]
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobError> {
        let res = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $2, result = $3, error = $4, trace = $5,
                retry_count = $6, execute_after = $7, updated_at = $8
            WHERE id = $1 AND status = $9
            "#,
        )
        .bind(job.id)
        .bind(job.status().as_str())
        .bind(job.result())
        .bind(job.error())
        .bind(job.trace())
        .bind(job.retry_count() as i32)
        .bind(job.execute_after())
        .bind(job.updated_at())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 1 {
            return Ok(());
        }
        match self.maybe_find_by_id(job.id).await? {
            None => Err(JobError::NotFound(job.id)),
            Some(_) => Err(JobError::StaleUpdate {
                id: job.id,
                expected,
            }),
        }
    }

    #[instrument(name = "job_ledger.list_by_status", skip(self), fields(n_found = tracing::field::Empty), err)]
    async fn list_by_status(
        &self,
        statuses: &[JobStatus],
        created_after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, JobError> {
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"{SELECT_COLUMNS}
            WHERE status = ANY($1)
              AND ($2::timestamptz IS NULL OR created_at > $2)
            ORDER BY created_at, id
            LIMIT $3"#
        ))
        .bind(&statuses)
        .bind(created_after)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        tracing::Span::current().record("n_found", rows.len());
        rows.into_iter().map(Job::try_from).collect()
    }

    #[instrument(name = "job_ledger.list_due_retries", level = "debug", skip(self), err)]
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"{SELECT_COLUMNS}
            WHERE status = $1
              AND (execute_after IS NULL OR execute_after <= $2)
            ORDER BY execute_after, id
            LIMIT $3"#
        ))
        .bind(JobStatus::FailedRetryable.as_str())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }
}
