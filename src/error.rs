//! Error types returned by the job service.

use thiserror::Error;

use crate::{JobId, broker::BrokerError, entity::JobStatus, entity::JobType};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("JobError - UnknownJobType: '{0}' has no registered initializer")]
    UnknownJobType(JobType),
    #[error("JobError - InvalidLane: lane name must not be empty")]
    InvalidLane,
    #[error("JobError - InvalidPayload: {0}")]
    InvalidPayload(String),
    #[error("JobError - NotFound: {0}")]
    NotFound(JobId),
    #[error("JobError - DuplicateId: {0}")]
    DuplicateId(JobId),
    #[error("JobError - InvalidTransition: {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("JobError - StaleUpdate: {id} is no longer {expected}")]
    StaleUpdate { id: JobId, expected: JobStatus },
    #[error("JobError - NotRetryable: {id} is {status}")]
    NotRetryable { id: JobId, status: JobStatus },
    #[error("JobError - CouldNotSerializeConfig: {0}")]
    CouldNotSerializeConfig(serde_json::Error),
    #[error("JobError - CouldNotSerializeResult: {0}")]
    CouldNotSerializeResult(serde_json::Error),
    #[error("JobError - CouldNotDeserializeRecord: {0}")]
    CouldNotDeserializeRecord(String),
    #[error("JobError - JobInitError: {0}")]
    JobInitError(String),
    #[error("JobError - Config: {0}")]
    Config(String),
    #[error("JobError - Sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JobError - Migrate: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("JobError - Broker: {0}")]
    Broker(#[from] BrokerError),
}
