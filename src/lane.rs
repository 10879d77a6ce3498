//! Named broker lanes and their relative priority.

use serde::{Deserialize, Serialize};

use std::{cmp::Ordering, fmt};

use crate::error::JobError;

#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// A named sub-queue of the broker. Any non-blank name is a valid lane.
pub struct Lane(String);

impl Lane {
    pub fn new(name: impl Into<String>) -> Result<Self, JobError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(JobError::InvalidLane);
        }
        if trimmed.len() == name.len() {
            Ok(Self(name))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Lane {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Lane::new(value)
    }
}

impl From<Lane> for String {
    fn from(lane: Lane) -> Self {
        lane.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
/// Lane names ordered from highest to lowest priority.
///
/// Lanes that are not listed are still accepted. They rank below every listed
/// lane and are ordered among themselves by name.
pub struct LanePriority(Vec<String>);

impl LanePriority {
    pub fn new<I, S>(lanes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for lane in lanes {
            let lane = lane.into();
            if !ordered.contains(&lane) {
                ordered.push(lane);
            }
        }
        Self(ordered)
    }

    /// Position of the lane in the priority order. Unlisted lanes share the
    /// lowest rank.
    pub fn rank(&self, lane: &Lane) -> usize {
        self.0
            .iter()
            .position(|name| name == lane.as_str())
            .unwrap_or(self.0.len())
    }

    pub fn compare(&self, a: &Lane, b: &Lane) -> Ordering {
        self.rank(a)
            .cmp(&self.rank(b))
            .then_with(|| a.as_str().cmp(b.as_str()))
    }

    /// Sort lanes highest priority first.
    pub fn sort(&self, lanes: &mut [Lane]) {
        lanes.sort_by(|a, b| self.compare(a, b));
    }
}

impl Default for LanePriority {
    fn default() -> Self {
        Self::new(["high", "medium", "low"])
    }
}
