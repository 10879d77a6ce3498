//! Registry mapping job type names to initializers and retry settings.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::{entity::*, error::JobError, runner::*};

/// Object-safe view of a [`JobInitializer`] with its `Config` type erased.
trait ErasedInitializer: Send + Sync {
    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>>;
}

impl<I: JobInitializer> ErasedInitializer for I {
    fn init(&self, job: &Job) -> Result<Box<dyn JobRunner>, Box<dyn std::error::Error>> {
        JobInitializer::init(self, job)
    }
}

struct Registered {
    initializer: Arc<dyn ErasedInitializer>,
    retry_settings: RetrySettings,
}

#[derive(Clone, Default)]
/// Keeps track of registered job types and their retry behaviour.
///
/// Cloning shares the same table, so types registered after workers started
/// are visible to them.
pub struct JobRegistry {
    entries: Arc<RwLock<HashMap<JobType, Registered>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`JobInitializer`] and its associated retry settings.
    /// Registering the same name again replaces the previous initializer.
    pub fn add_initializer<I: JobInitializer>(&self, initializer: I) -> JobType {
        let job_type = initializer.job_type();
        let retry_settings = initializer.retry_settings();
        self.entries
            .write()
            .expect("Couldn't lock Registry RwLock")
            .insert(
                job_type.clone(),
                Registered {
                    initializer: Arc::new(initializer),
                    retry_settings,
                },
            );
        job_type
    }

    pub fn is_registered(&self, job_type: &JobType) -> bool {
        self.entries
            .read()
            .expect("Couldn't lock Registry RwLock")
            .contains_key(job_type)
    }

    /// Reconstruct a runnable instance from the persisted record.
    pub(crate) fn init_job(&self, job: &Job) -> Result<Box<dyn JobRunner>, JobError> {
        let initializer = self
            .entries
            .read()
            .expect("Couldn't lock Registry RwLock")
            .get(&job.job_type)
            .map(|entry| Arc::clone(&entry.initializer))
            .ok_or_else(|| JobError::UnknownJobType(job.job_type.clone()))?;
        initializer
            .init(job)
            .map_err(|e| JobError::JobInitError(e.to_string()))
    }

    /// Retry settings for a job type, falling back to the defaults for types
    /// this process does not know.
    pub(crate) fn retry_settings(&self, job_type: &JobType) -> RetrySettings {
        self.entries
            .read()
            .expect("Couldn't lock Registry RwLock")
            .get(job_type)
            .map(|entry| entry.retry_settings.clone())
            .unwrap_or_default()
    }
}
