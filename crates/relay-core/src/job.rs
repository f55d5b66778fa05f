//! Upstream job and result wire shapes.
//!
//! Jobs are relayed mostly opaquely: fields the relay does not act on are kept in `extra` so a
//! downstream node receives exactly what upstream sent, apart from the retargeted identifiers.

use crate::{Error, Result, SubNode, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

pub const AVAILABILITY_TAG: &str = "AvailabilityJob";
pub const DISTRIBUTION_TAG: &str = "CollectionAnalysisJob";

pub const ANALYSIS_DISTRIBUTION: &str = "DISTRIBUTION";
pub const CODE_GENERIC: &str = "GENERIC";
pub const CODE_DEMOGRAPHICS: &str = "DEMOGRAPHICS";

pub const PROTOCOL_VERSION: &str = "v2";

/// Upstream job queues the relay can poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Availability,
    Distribution,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Availability, JobType::Distribution];

    /// Suffix appended to the collection id on the upstream `nextjob` endpoint.
    pub fn suffix(&self) -> &'static str {
        match self {
            JobType::Availability => "a",
            JobType::Distribution => "b",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Availability => "availability",
            JobType::Distribution => "distribution",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "availability" | "a" => Ok(JobType::Availability),
            "distribution" | "b" => Ok(JobType::Distribution),
            other => Err(Error::UnsupportedType(format!("job type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityJob {
    pub uuid: String,
    pub collection: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub cohort: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionJob {
    pub uuid: String,
    pub collection: String,
    #[serde(default)]
    pub owner: String,
    pub code: String,
    #[serde(default = "default_analysis")]
    pub analysis: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_analysis() -> String {
    ANALYSIS_DISTRIBUTION.to_string()
}

/// A job as carried on a per-target queue: the tag selects the payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    Availability(AvailabilityJob),
    Distribution(DistributionJob),
}

impl JobMessage {
    pub fn type_tag(&self) -> &'static str {
        match self {
            JobMessage::Availability(_) => AVAILABILITY_TAG,
            JobMessage::Distribution(_) => DISTRIBUTION_TAG,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobMessage::Availability(_) => JobType::Availability,
            JobMessage::Distribution(_) => JobType::Distribution,
        }
    }

    /// Rebuild a message from its queue tag and payload. Unknown tags are rejected here.
    pub fn from_parts(tag: &str, payload: Value) -> Result<Self> {
        match tag {
            AVAILABILITY_TAG => Ok(JobMessage::Availability(serde_json::from_value(payload)?)),
            DISTRIBUTION_TAG => Ok(JobMessage::Distribution(serde_json::from_value(payload)?)),
            other => Err(Error::UnsupportedType(format!("queue message tag {other}"))),
        }
    }

    /// Decode a job fetched from the upstream queue for `job_type`.
    pub fn from_upstream(job_type: JobType, payload: Value) -> Result<Self> {
        match job_type {
            JobType::Availability => Self::from_parts(AVAILABILITY_TAG, payload),
            JobType::Distribution => Self::from_parts(DISTRIBUTION_TAG, payload),
        }
    }

    pub fn to_payload(&self) -> Result<Value> {
        let value = match self {
            JobMessage::Availability(job) => serde_json::to_value(job)?,
            JobMessage::Distribution(job) => serde_json::to_value(job)?,
        };
        Ok(value)
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            JobMessage::Availability(job) => &job.uuid,
            JobMessage::Distribution(job) => &job.uuid,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            JobMessage::Availability(job) => &job.collection,
            JobMessage::Distribution(job) => &job.collection,
        }
    }

    pub fn owner(&self) -> &str {
        match self {
            JobMessage::Availability(job) => &job.owner,
            JobMessage::Distribution(job) => &job.owner,
        }
    }

    pub fn classify(&self) -> Result<TaskType> {
        match self {
            JobMessage::Availability(_) => Ok(TaskType::Availability),
            JobMessage::Distribution(job) => {
                if !job.analysis.eq_ignore_ascii_case(ANALYSIS_DISTRIBUTION) {
                    return Err(Error::UnsupportedType(format!("analysis {}", job.analysis)));
                }
                if job.code.eq_ignore_ascii_case(CODE_GENERIC) {
                    Ok(TaskType::GenericDistribution)
                } else if job.code.eq_ignore_ascii_case(CODE_DEMOGRAPHICS) {
                    Ok(TaskType::DemographicsDistribution)
                } else {
                    Err(Error::UnsupportedType(format!("distribution code {}", job.code)))
                }
            }
        }
    }

    /// Clone this job for one SubNode: new correlation id, the node's id as collection and the
    /// node's owning credential as owner.
    pub fn retarget(&self, correlation_id: &str, subnode: &SubNode) -> JobMessage {
        let mut job = self.clone();
        match &mut job {
            JobMessage::Availability(j) => {
                j.uuid = correlation_id.to_string();
                j.collection = subnode.id.clone();
                j.owner = subnode.owner.clone();
            }
            JobMessage::Distribution(j) => {
                j.uuid = correlation_id.to_string();
                j.collection = subnode.id.clone();
                j.owner = subnode.owner.clone();
            }
        }
        job
    }
}

/// A result as reported by a downstream node and as submitted upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub uuid: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "protocolVersion", default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(rename = "queryResult", default)]
    pub query_result: QueryResult,
}

fn default_status() -> String {
    "ok".to_string()
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl JobResult {
    pub fn ok(uuid: impl Into<String>, collection_id: impl Into<String>, query_result: QueryResult) -> Self {
        Self {
            uuid: uuid.into(),
            status: default_status(),
            collection_id: collection_id.into(),
            message: None,
            protocol_version: default_protocol_version(),
            query_result,
        }
    }

    /// Parse a raw subtask result. `None` means the node contributed nothing usable.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub count: i64,
    #[serde(rename = "datasetCount", default)]
    pub dataset_count: i64,
    #[serde(default)]
    pub files: Vec<ResultFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub file_name: String,
    /// Base64-encoded file contents.
    pub file_data: String,
    #[serde(default)]
    pub file_description: Option<String>,
    #[serde(default)]
    pub file_reference: String,
    #[serde(default)]
    pub file_sensitive: bool,
    /// Size of the decoded contents in megabytes.
    #[serde(default)]
    pub file_size: f64,
    #[serde(default = "default_file_type")]
    pub file_type: String,
}

fn default_file_type() -> String {
    "BCOS".to_string()
}
