//! Redis-backed broker: one list per lane, popped with `BLPOP` over the lane
//! keys in priority order.

use async_trait::async_trait;
use tracing::instrument;

use std::time::Duration;

use super::{BrokerError, JobBroker, JobReference};
use crate::lane::{Lane, LanePriority};

const DEFAULT_KEY_PREFIX: &str = "lane-jobs";

#[derive(Clone, Debug)]
pub struct RedisBroker {
    client: redis::Client,
    priority: LanePriority,
    prefix: String,
}

impl RedisBroker {
    /// Create a broker for the given Redis URL (e.g. `redis://localhost:6379`).
    pub fn new(
        redis_url: impl AsRef<str>,
        priority: LanePriority,
        prefix: Option<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())?;
        Ok(Self {
            client,
            priority,
            prefix: prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }

    fn lanes_key(&self) -> String {
        format!("{}:lanes", self.prefix)
    }

    fn lane_key(&self, lane: &Lane) -> String {
        format!("{}:lane:{}", self.prefix, lane)
    }

    /// Run a blocking Redis interaction off the async executor.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> Result<T, BrokerError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn ordered_lane_keys(&self) -> Result<Vec<String>, BrokerError> {
        let lanes_key = self.lanes_key();
        let names: Vec<String> = self
            .with_connection(move |conn| {
                Ok(redis::cmd("SMEMBERS").arg(&lanes_key).query(conn)?)
            })
            .await?;
        let mut lanes: Vec<Lane> = names.into_iter().filter_map(|n| Lane::new(n).ok()).collect();
        self.priority.sort(&mut lanes);
        Ok(lanes.iter().map(|lane| self.lane_key(lane)).collect())
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    #[instrument(name = "broker.redis.push", skip(self), fields(job_id = %reference.id, lane = %reference.lane), err)]
    async fn push(&self, reference: JobReference) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(&reference)?;
        let lanes_key = self.lanes_key();
        let lane_key = self.lane_key(&reference.lane);
        let lane = reference.lane.to_string();
        self.with_connection(move |conn| {
            redis::pipe()
                .atomic()
                .cmd("SADD")
                .arg(&lanes_key)
                .arg(&lane)
                .ignore()
                .cmd("RPUSH")
                .arg(&lane_key)
                .arg(&payload)
                .ignore()
                .query::<()>(conn)?;
            Ok(())
        })
        .await
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobReference>, BrokerError> {
        let keys = self.ordered_lane_keys().await?;
        if keys.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(None);
        }
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = self
            .with_connection(move |conn| Ok(redis::cmd("BLPOP").arg(&keys).arg(secs).query(conn)?))
            .await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn contains(&self, reference: &JobReference) -> Result<bool, BrokerError> {
        let payload = serde_json::to_string(reference)?;
        let lane_key = self.lane_key(&reference.lane);
        let position: Option<i64> = self
            .with_connection(move |conn| {
                Ok(redis::cmd("LPOS").arg(&lane_key).arg(&payload).query(conn)?)
            })
            .await?;
        Ok(position.is_some())
    }
}
