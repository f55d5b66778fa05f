use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Classification of a relay task, derived from the shape of the upstream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "availability")]
    Availability,
    #[serde(rename = "distribution.generic")]
    GenericDistribution,
    #[serde(rename = "distribution.demographics")]
    DemographicsDistribution,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::Availability,
        TaskType::GenericDistribution,
        TaskType::DemographicsDistribution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Availability => "availability",
            TaskType::GenericDistribution => "distribution.generic",
            TaskType::DemographicsDistribution => "distribution.demographics",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnsupportedType(s.to_string()))
    }
}

/// One upstream unit of work being relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayTask {
    /// Upstream correlation id.
    pub id: String,
    pub task_type: TaskType,
    pub collection: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RelayTask {
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        self.created_at + threshold < now
    }
}

#[derive(Debug, Clone)]
pub struct NewRelayTask {
    pub id: String,
    pub task_type: TaskType,
    pub collection: String,
}

/// One execution node's slice of a relay task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySubTask {
    /// Correlation id seen by the downstream node.
    pub id: Uuid,
    /// SubNode id the subjob was sent to.
    pub owner: String,
    pub relay_task_id: String,
    pub result: Option<String>,
}

/// An execution-node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubNode {
    /// Queue name and downstream collection id.
    pub id: String,
    /// Credential username allowed to act for this node.
    pub owner: String,
}
