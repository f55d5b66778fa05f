//! Fan-out of one upstream job into per-SubNode subjobs.

use relay_core::{
    JobMessage, NewRelayTask, RelayStore, RelaySubTask, RelayTask, Result, SubNode, TaskQueue,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub task: RelayTask,
    pub subtasks: Vec<RelaySubTask>,
    /// Number of subjobs that reached their SubNode queue.
    pub published: usize,
    /// SubNode ids whose publish failed.
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    store: Arc<dyn RelayStore>,
    queue: Arc<dyn TaskQueue>,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn RelayStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Persist the task with one subtask per target, then publish a retargeted clone of `job` to
    /// each target queue.
    ///
    /// A failed publish is logged and does not stop the remaining targets; the task can still
    /// complete on a subset through expiry.
    pub async fn dispatch(&self, job: &JobMessage, targets: &[SubNode]) -> Result<DispatchOutcome> {
        let task_type = job.classify()?;

        let (task, subtasks) = self
            .store
            .create_task(
                NewRelayTask {
                    id: job.correlation_id().to_string(),
                    task_type,
                    collection: job.collection().to_string(),
                },
                targets,
            )
            .await?;

        let mut published = 0;
        let mut failed = Vec::new();
        for subtask in &subtasks {
            let Some(target) = targets.iter().find(|t| t.id == subtask.owner) else {
                continue;
            };
            let subjob = job.retarget(&subtask.id.to_string(), target);

            match self.queue.publish(&target.id, &subjob).await {
                Ok(()) => published += 1,
                Err(err) => {
                    tracing::warn!(
                        event = "relay.dispatch.publish.error",
                        task_id = %task.id,
                        subtask_id = %subtask.id,
                        subnode_id = %target.id,
                        error = %err,
                        "failed to publish subjob"
                    );
                    failed.push(target.id.clone());
                }
            }
        }

        tracing::info!(
            event = "relay.dispatch.task.created",
            task_id = %task.id,
            task_type = %task.task_type,
            subtasks = subtasks.len(),
            published,
            "dispatched task"
        );

        Ok(DispatchOutcome {
            task,
            subtasks,
            published,
            failed,
        })
    }
}
