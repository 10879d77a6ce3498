use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use super::{BrokerError, JobBroker, JobReference};
use crate::{
    JobId,
    lane::{Lane, LanePriority},
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct LaneKey {
    rank: usize,
    lane: Lane,
}

/// Process-local broker. Contents are lost when the process exits, which is
/// exactly the failure mode the reconciler repairs.
pub struct InMemoryBroker {
    priority: LanePriority,
    lanes: Mutex<BTreeMap<LaneKey, VecDeque<JobId>>>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new(priority: LanePriority) -> Self {
        Self {
            priority,
            lanes: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
        }
    }

    fn key(&self, lane: &Lane) -> LaneKey {
        LaneKey {
            rank: self.priority.rank(lane),
            lane: lane.clone(),
        }
    }

    async fn try_pop(&self) -> Option<JobReference> {
        let mut lanes = self.lanes.lock().await;
        for (key, queue) in lanes.iter_mut() {
            if let Some(id) = queue.pop_front() {
                return Some(JobReference {
                    id,
                    lane: key.lane.clone(),
                });
            }
        }
        None
    }

    /// Drop every waiting reference, as a broker restart would.
    pub async fn clear(&self) {
        self.lanes.lock().await.clear();
    }

    pub async fn total_len(&self) -> usize {
        self.lanes.lock().await.values().map(VecDeque::len).sum()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(LanePriority::default())
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn push(&self, reference: JobReference) -> Result<(), BrokerError> {
        let key = self.key(&reference.lane);
        self.lanes
            .lock()
            .await
            .entry(key)
            .or_default()
            .push_back(reference.id);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<JobReference>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(reference) = self.try_pop().await {
                return Ok(Some(reference));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn contains(&self, reference: &JobReference) -> Result<bool, BrokerError> {
        let key = self.key(&reference.lane);
        Ok(self
            .lanes
            .lock()
            .await
            .get(&key)
            .is_some_and(|queue| queue.contains(&reference.id)))
    }
}
