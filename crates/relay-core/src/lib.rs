//! Shared core abstractions for the task relay.
//!
//! This crate defines the cross-crate contracts used by the dispatcher and the harness: the relay
//! data model, the upstream job wire shapes, the queue and store interfaces, and the obfuscation
//! transform applied to every count before it leaves the relay.
//!
//! # API notes
//! `relay-core` is an internal crate (`publish = false`). Its public API uses a few third-party
//! types (`uuid::Uuid`, `chrono::DateTime<Utc>`, `serde_json::Value`,
//! `tokio_util::sync::CancellationToken`) as part of the relay contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod distribution;
pub mod job;
pub mod lite;
pub mod model;
pub mod obfuscate;

pub use job::{JobMessage, JobResult, JobType, QueryResult, ResultFile};
pub use model::{NewRelayTask, RelaySubTask, RelayTask, SubNode, TaskType};
pub use obfuscate::{obfuscate, Obfuscator};

/// Prefix of every transient reply queue name.
///
/// Tasks whose collection carries this prefix were created by the synchronous bridge; their
/// aggregate is delivered to the reply queue instead of the upstream job source.
pub const REPLY_QUEUE_PREFIX: &str = "relay.reply.";

pub fn is_reply_queue(name: &str) -> bool {
    name.starts_with(REPLY_QUEUE_PREFIX)
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A write against a terminal task. Callers treat this as "already accepted".
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported task type: {0}")]
    UnsupportedType(String),

    #[error("upstream submission failed with status {status}")]
    UpstreamSubmission { status: u16 },

    #[error("queue backend unavailable: {0}")]
    BrokerUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Other(anyhow::anyhow!(message.into()))
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Server-side upstream failures are the only ones worth retrying.
    pub fn is_retryable_upstream(&self) -> bool {
        matches!(self, Self::UpstreamSubmission { status } if (500..600).contains(status))
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::Other(anyhow::Error::from(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Other(anyhow::Error::from(value))
    }
}

/// Durable point-to-point queue addressed by target (SubNode) id.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a tagged job on the queue named `target`.
    async fn publish(&self, target: &str, job: &JobMessage) -> Result<()>;

    /// Single non-blocking fetch. `None` when the queue is empty.
    async fn pop(&self, target: &str) -> Result<Option<JobMessage>>;

    /// Connectivity check, optionally also checking that `queue` exists. No side effects.
    async fn is_ready(&self, queue: Option<&str>) -> bool;
}

/// Transient, self-expiring queues used for one request/response rendezvous each.
#[async_trait]
pub trait ReplyQueue: Send + Sync {
    /// Allocate a uniquely named reply queue and return its name.
    async fn create_result_queue(&self) -> Result<String>;

    async fn publish_reply(&self, queue: &str, value: i64) -> Result<()>;

    /// Wait for the single reply on `queue`.
    ///
    /// Returns `Ok(None)` when `cancel` fires first. The queue is discarded either way.
    async fn await_reply(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<i64>>;
}

/// Persistence and lifecycle operations over relay tasks, subtasks and SubNodes.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Create the parent task and one subtask per owner in a single unit of work.
    async fn create_task(
        &self,
        task: NewRelayTask,
        owners: &[SubNode],
    ) -> Result<(RelayTask, Vec<RelaySubTask>)>;

    async fn get_task(&self, id: &str) -> Result<Option<RelayTask>>;

    async fn get_subtask(&self, id: Uuid) -> Result<Option<RelaySubTask>>;

    async fn list_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>>;

    /// Subtasks of `task_id` that have not reported a result, read fresh.
    async fn list_incomplete_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>>;

    async fn list_incomplete_tasks(&self) -> Result<Vec<RelayTask>>;

    /// Store a subtask result. Fails `NotFound` for an unknown subtask and `Conflict` when the
    /// parent task is terminal. An existing result is overwritten.
    async fn set_subtask_result(&self, id: Uuid, result: &str) -> Result<RelaySubTask>;

    /// Compare-and-set `completed_at`. Returns the terminal task if this call made the
    /// transition, `None` if the task was already terminal.
    async fn try_complete_task(&self, id: &str) -> Result<Option<RelayTask>>;

    /// Delete a task and, by cascade, its subtasks.
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Register a SubNode. A missing `id` is generated; an existing `id` is updated in place.
    async fn create_subnode(&self, owner: &str, id: Option<&str>) -> Result<SubNode>;

    async fn get_subnode(&self, id: &str) -> Result<Option<SubNode>>;

    async fn list_subnodes(&self) -> Result<Vec<SubNode>>;

    async fn delete_subnode(&self, id: &str) -> Result<bool>;
}
