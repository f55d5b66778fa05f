//! Fan-in: subtask result intake, task completion, upstream delivery and the expiry sweep.

use crate::{aggregate::AggregatorRegistry, upstream::JobSource};
use anyhow::Context;
use chrono::{DateTime, Utc};
use relay_core::{
    is_reply_queue, JobResult, Obfuscator, QueryResult, RelayStore, RelaySubTask,
    RelayTask, ReplyQueue, Result,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Age after which an open task is force-completed by the sweep.
    pub task_expiry: Duration,
    pub submit_retry_delay: Duration,
    /// Total upstream submission attempts, including the first.
    pub submit_max_attempts: u32,
    /// Delete terminal tasks (and their subtasks) once delivered.
    pub purge_completed_tasks: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            task_expiry: Duration::from_secs(240),
            submit_retry_delay: Duration::from_secs(5),
            submit_max_attempts: 5,
            purge_completed_tasks: false,
        }
    }
}

/// Result of a task's terminal transition.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: RelayTask,
    /// `None` when no aggregator handles the task type.
    pub answer: Option<QueryResult>,
    /// Whether the answer reached upstream (or the reply queue).
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub subtask: RelaySubTask,
    /// Set when this submission was the one that closed the task.
    pub completion: Option<Completion>,
}

pub struct ResultCollector {
    store: Arc<dyn RelayStore>,
    replies: Arc<dyn ReplyQueue>,
    upstream: Arc<dyn JobSource>,
    aggregators: AggregatorRegistry,
    obfuscator: Obfuscator,
    settings: CollectorSettings,
}

impl ResultCollector {
    pub fn new(
        store: Arc<dyn RelayStore>,
        replies: Arc<dyn ReplyQueue>,
        upstream: Arc<dyn JobSource>,
        aggregators: AggregatorRegistry,
        obfuscator: Obfuscator,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            store,
            replies,
            upstream,
            aggregators,
            obfuscator,
            settings,
        }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Store one node's raw result and complete the parent task once nothing is outstanding.
    ///
    /// `NotFound` for an unknown subtask, `Conflict` when the parent is already terminal.
    pub async fn submit_subtask_result(&self, subtask_id: Uuid, raw: &str) -> Result<SubmitOutcome> {
        let subtask = self.store.set_subtask_result(subtask_id, raw).await?;

        tracing::debug!(
            event = "relay.collector.subtask.result",
            task_id = %subtask.relay_task_id,
            subtask_id = %subtask.id,
            subnode_id = %subtask.owner,
            "stored subtask result"
        );

        let outstanding = self
            .store
            .list_incomplete_subtasks(&subtask.relay_task_id)
            .await?;
        let completion = if outstanding.is_empty() {
            self.complete(&subtask.relay_task_id).await?
        } else {
            None
        };

        Ok(SubmitOutcome {
            subtask,
            completion,
        })
    }

    /// Close `task_id`, aggregate whatever results have arrived and deliver the answer.
    ///
    /// The terminal transition happens first, so exactly one caller proceeds to aggregation.
    /// Returns `None` when the task was already terminal. Delivery failures are logged and
    /// reported through [`Completion::delivered`]; the task stays terminal either way.
    pub async fn complete(&self, task_id: &str) -> Result<Option<Completion>> {
        let Some(task) = self.store.try_complete_task(task_id).await? else {
            return Ok(None);
        };

        let subtasks = self.store.list_subtasks(&task.id).await?;
        let reported = subtasks.iter().filter(|s| s.result.is_some()).count();
        let results: Vec<Option<String>> = subtasks.into_iter().map(|s| s.result).collect();

        let Some(aggregator) = self.aggregators.get(task.task_type) else {
            tracing::warn!(
                event = "relay.collector.aggregate.unsupported",
                task_id = %task.id,
                task_type = %task.task_type,
                "no aggregator for task type; closing without submission"
            );
            self.purge(&task).await;
            return Ok(Some(Completion {
                task,
                answer: None,
                delivered: false,
            }));
        };

        let answer = aggregator.process(&task.collection, &results, &self.obfuscator);
        let delivered = match self.deliver(&task, &answer).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    event = "relay.collector.deliver.error",
                    task_id = %task.id,
                    error = %err,
                    "failed to deliver aggregated answer"
                );
                false
            }
        };

        tracing::info!(
            event = "relay.collector.task.completed",
            task_id = %task.id,
            task_type = %task.task_type,
            subtasks = results.len(),
            reported,
            delivered,
            "task completed"
        );

        self.purge(&task).await;
        Ok(Some(Completion {
            task,
            answer: Some(answer),
            delivered,
        }))
    }

    async fn deliver(&self, task: &RelayTask, answer: &QueryResult) -> Result<()> {
        if is_reply_queue(&task.collection) {
            return self.replies.publish_reply(&task.collection, answer.count).await;
        }
        let result = JobResult::ok(task.id.clone(), task.collection.clone(), answer.clone());
        self.submit_upstream(&result).await
    }

    /// Submit with bounded retry on server-side failures. A conflict means upstream already has
    /// the answer and counts as success.
    pub async fn submit_upstream(&self, result: &JobResult) -> Result<()> {
        let max_attempts = self.settings.submit_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.upstream.submit_result(result).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    tracing::info!(
                        event = "relay.collector.submit.already_final",
                        task_id = %result.uuid,
                        "upstream already finalized job"
                    );
                    return Ok(());
                }
                Err(err) if err.is_retryable_upstream() && attempt < max_attempts => {
                    tracing::warn!(
                        event = "relay.collector.submit.retry",
                        task_id = %result.uuid,
                        attempt,
                        error = %err,
                        "upstream submission failed; retrying"
                    );
                    tokio::time::sleep(self.settings.submit_retry_delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn purge(&self, task: &RelayTask) {
        if !self.settings.purge_completed_tasks {
            return;
        }
        if let Err(err) = self.store.delete_task(&task.id).await {
            tracing::warn!(
                event = "relay.collector.purge.error",
                task_id = %task.id,
                error = %err,
                "failed to purge completed task"
            );
        }
    }

    /// Force-complete every open task older than the expiry threshold. Returns how many tasks
    /// this call closed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = chrono::Duration::from_std(self.settings.task_expiry)
            .context("task expiry out of range")?;

        let mut closed = 0;
        for task in self.store.list_incomplete_tasks().await? {
            if !task.is_expired(now, threshold) {
                continue;
            }
            match self.complete(&task.id).await {
                Ok(Some(_)) => {
                    closed += 1;
                    tracing::info!(
                        event = "relay.collector.task.expired",
                        task_id = %task.id,
                        created_at = %task.created_at,
                        "force-completed expired task"
                    );
                }
                Ok(None) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    tracing::warn!(
                        event = "relay.collector.expire.error",
                        task_id = %task.id,
                        error = %err,
                        "failed to complete expired task"
                    );
                }
            }
        }
        Ok(closed)
    }
}

impl std::fmt::Debug for ResultCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCollector")
            .field("aggregators", &self.aggregators)
            .field("obfuscator", &self.obfuscator)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn expiry_sweep_loop(
    collector: Arc<ResultCollector>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        if let Err(err) = collector.sweep_expired(Utc::now()).await {
            tracing::warn!(
                event = "relay.collector.sweep.error",
                error = %err,
                "expiry sweep error"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

