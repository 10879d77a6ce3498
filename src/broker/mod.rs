//! Volatile, lane-ordered queue of job references.
//!
//! The broker only carries `{id, lane}` pointers. It may lose entries on a
//! crash; the ledger stays authoritative and [`JobReconciler`](crate::JobReconciler)
//! rebuilds missing references from it.

mod memory;
#[cfg(feature = "redis")]
mod redis_lists;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

use crate::{JobId, lane::Lane};

pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_lists::RedisBroker;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Pointer placed on the broker; resolved back to the ledger record by id.
pub struct JobReference {
    pub id: JobId,
    pub lane: Lane,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("BrokerError - Unavailable: {0}")]
    Unavailable(String),
    #[error("BrokerError - Serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "redis")]
    #[error("BrokerError - Redis: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[async_trait]
/// Delivery order is strict lane priority, FIFO within a lane. Each pushed
/// reference is handed to at most one `pop` caller.
pub trait JobBroker: Send + Sync + 'static {
    /// Append a reference to the tail of its lane.
    async fn push(&self, reference: JobReference) -> Result<(), BrokerError>;

    /// Take the head of the highest-priority non-empty lane, waiting up to
    /// `timeout` for one to appear.
    async fn pop(&self, timeout: Duration) -> Result<Option<JobReference>, BrokerError>;

    /// Whether an identical reference is currently waiting on its lane.
    async fn contains(&self, reference: &JobReference) -> Result<bool, BrokerError>;
}
