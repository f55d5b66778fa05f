//! In-process store and queue.
//!
//! Both keep all state behind a single mutex, so every operation observes a consistent snapshot
//! and the terminal transition is a true compare-and-set. Queue messages are stored as
//! `(tag, payload)` pairs so the tag round-trip matches the Postgres queue.

use crate::{
    Error, JobMessage, NewRelayTask, RelayStore, RelaySubTask, RelayTask, ReplyQueue, Result,
    SubNode, TaskQueue, REPLY_QUEUE_PREFIX,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<String, RelayTask>,
    subtasks: HashMap<Uuid, RelaySubTask>,
    subnodes: Vec<SubNode>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| Error::msg("memory store lock poisoned"))
    }
}

fn sorted(mut subtasks: Vec<RelaySubTask>) -> Vec<RelaySubTask> {
    subtasks.sort_by(|a, b| a.owner.cmp(&b.owner).then(a.id.cmp(&b.id)));
    subtasks
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn create_task(
        &self,
        task: NewRelayTask,
        owners: &[SubNode],
    ) -> Result<(RelayTask, Vec<RelaySubTask>)> {
        let mut state = self.state()?;
        if state.tasks.contains_key(&task.id) {
            return Err(Error::Conflict(format!("task {} already exists", task.id)));
        }

        let created = RelayTask {
            id: task.id,
            task_type: task.task_type,
            collection: task.collection,
            created_at: Utc::now(),
            completed_at: None,
        };

        let subtasks: Vec<RelaySubTask> = owners
            .iter()
            .map(|owner| RelaySubTask {
                id: Uuid::new_v4(),
                owner: owner.id.clone(),
                relay_task_id: created.id.clone(),
                result: None,
            })
            .collect();

        for subtask in &subtasks {
            state.subtasks.insert(subtask.id, subtask.clone());
        }
        state.tasks.insert(created.id.clone(), created.clone());
        Ok((created, subtasks))
    }

    async fn get_task(&self, id: &str) -> Result<Option<RelayTask>> {
        Ok(self.state()?.tasks.get(id).cloned())
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Option<RelaySubTask>> {
        Ok(self.state()?.subtasks.get(&id).cloned())
    }

    async fn list_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>> {
        let state = self.state()?;
        Ok(sorted(
            state
                .subtasks
                .values()
                .filter(|s| s.relay_task_id == task_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_incomplete_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>> {
        let state = self.state()?;
        Ok(sorted(
            state
                .subtasks
                .values()
                .filter(|s| s.relay_task_id == task_id && s.result.is_none())
                .cloned()
                .collect(),
        ))
    }

    async fn list_incomplete_tasks(&self) -> Result<Vec<RelayTask>> {
        let state = self.state()?;
        let mut tasks: Vec<RelayTask> = state
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn set_subtask_result(&self, id: Uuid, result: &str) -> Result<RelaySubTask> {
        let mut state = self.state()?;
        let task_id = state
            .subtasks
            .get(&id)
            .map(|s| s.relay_task_id.clone())
            .ok_or_else(|| Error::not_found("subtask", id.to_string()))?;

        match state.tasks.get(&task_id) {
            None => return Err(Error::not_found("task", task_id)),
            Some(task) if task.is_terminal() => {
                return Err(Error::Conflict(format!("task {task_id} is already complete")))
            }
            Some(_) => {}
        }

        let subtask = state
            .subtasks
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("subtask", id.to_string()))?;
        subtask.result = Some(result.to_string());
        Ok(subtask.clone())
    }

    async fn try_complete_task(&self, id: &str) -> Result<Option<RelayTask>> {
        let mut state = self.state()?;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::not_found("task", id))?;
        if task.is_terminal() {
            return Ok(None);
        }
        task.completed_at = Some(Utc::now());
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let mut state = self.state()?;
        state.tasks.remove(id);
        state.subtasks.retain(|_, s| s.relay_task_id != id);
        Ok(())
    }

    async fn create_subnode(&self, owner: &str, id: Option<&str>) -> Result<SubNode> {
        let mut state = self.state()?;
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = state.subnodes.iter_mut().find(|n| n.id == id) {
            existing.owner = owner.to_string();
            return Ok(existing.clone());
        }

        let node = SubNode {
            id,
            owner: owner.to_string(),
        };
        state.subnodes.push(node.clone());
        Ok(node)
    }

    async fn get_subnode(&self, id: &str) -> Result<Option<SubNode>> {
        Ok(self.state()?.subnodes.iter().find(|n| n.id == id).cloned())
    }

    async fn list_subnodes(&self) -> Result<Vec<SubNode>> {
        Ok(self.state()?.subnodes.clone())
    }

    async fn delete_subnode(&self, id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let before = state.subnodes.len();
        state.subnodes.retain(|n| n.id != id);
        Ok(state.subnodes.len() != before)
    }
}

#[derive(Debug)]
struct ReplySlot {
    tx: watch::Sender<Option<i64>>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    targets: HashMap<String, VecDeque<(String, Value)>>,
    replies: HashMap<String, ReplySlot>,
}

#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    reply_ttl: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            reply_ttl: Duration::from_secs(600),
        }
    }

    pub fn with_reply_ttl(mut self, ttl: Duration) -> Self {
        self.reply_ttl = ttl;
        self
    }

    /// Number of messages waiting on `target`.
    pub fn depth(&self, target: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.targets.get(target).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::msg("memory queue lock poisoned"))
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, target: &str, job: &JobMessage) -> Result<()> {
        let payload = job.to_payload()?;
        self.state()?
            .targets
            .entry(target.to_string())
            .or_default()
            .push_back((job.type_tag().to_string(), payload));
        Ok(())
    }

    async fn pop(&self, target: &str) -> Result<Option<JobMessage>> {
        let popped = self
            .state()?
            .targets
            .get_mut(target)
            .and_then(VecDeque::pop_front);
        match popped {
            Some((tag, payload)) => JobMessage::from_parts(&tag, payload).map(Some),
            None => Ok(None),
        }
    }

    async fn is_ready(&self, queue: Option<&str>) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        match queue {
            None => true,
            Some(name) => {
                state.targets.contains_key(name)
                    || state
                        .replies
                        .get(name)
                        .is_some_and(|slot| slot.expires_at > Instant::now())
            }
        }
    }
}

#[async_trait]
impl ReplyQueue for MemoryQueue {
    async fn create_result_queue(&self) -> Result<String> {
        let mut state = self.state()?;
        let now = Instant::now();
        state.replies.retain(|_, slot| slot.expires_at > now);

        let name = format!("{REPLY_QUEUE_PREFIX}{}", Uuid::new_v4());
        let (tx, _rx) = watch::channel(None);
        state.replies.insert(
            name.clone(),
            ReplySlot {
                tx,
                expires_at: now + self.reply_ttl,
            },
        );
        Ok(name)
    }

    async fn publish_reply(&self, queue: &str, value: i64) -> Result<()> {
        let state = self.state()?;
        let slot = state
            .replies
            .get(queue)
            .filter(|slot| slot.expires_at > Instant::now())
            .ok_or_else(|| Error::not_found("reply queue", queue))?;
        slot.tx.send_replace(Some(value));
        Ok(())
    }

    async fn await_reply(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<i64>> {
        let mut rx = {
            let state = self.state()?;
            let slot = state
                .replies
                .get(queue)
                .ok_or_else(|| Error::not_found("reply queue", queue))?;
            slot.tx.subscribe()
        };

        let res = tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            got = rx.wait_for(Option::is_some) => match got {
                Ok(value) => Ok(*value),
                Err(_) => Err(Error::msg(format!("reply queue {queue} closed"))),
            },
        };

        self.state()?.replies.remove(queue);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AvailabilityJob;
    use serde_json::json;

    fn job(uuid: &str) -> JobMessage {
        JobMessage::Availability(AvailabilityJob {
            uuid: uuid.to_string(),
            collection: "c".into(),
            owner: "o".into(),
            cohort: json!({}),
            extra: Default::default(),
        })
    }

    #[tokio::test]
    async fn pop_is_fifo_and_non_blocking() -> anyhow::Result<()> {
        let q = MemoryQueue::new();
        anyhow::ensure!(q.pop("node").await?.is_none(), "expected empty queue");

        q.publish("node", &job("1")).await?;
        q.publish("node", &job("2")).await?;
        anyhow::ensure!(q.depth("node") == 2);

        let first = q.pop("node").await?.map(|j| j.correlation_id().to_string());
        let second = q.pop("node").await?.map(|j| j.correlation_id().to_string());
        anyhow::ensure!(first.as_deref() == Some("1") && second.as_deref() == Some("2"));
        anyhow::ensure!(q.pop("node").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reply_arrives_once_and_queue_is_discarded() -> anyhow::Result<()> {
        let q = std::sync::Arc::new(MemoryQueue::new());
        let name = q.create_result_queue().await?;
        anyhow::ensure!(q.is_ready(Some(&name)).await, "reply queue should exist");

        let publisher = q.clone();
        let target = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_reply(&target, 42).await
        });

        let got = q.await_reply(&name, &CancellationToken::new()).await?;
        anyhow::ensure!(got == Some(42), "expected 42, got {got:?}");
        anyhow::ensure!(!q.is_ready(Some(&name)).await, "reply queue should be gone");
        anyhow::ensure!(q.publish_reply(&name, 1).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_wait_returns_no_answer() -> anyhow::Result<()> {
        let q = MemoryQueue::new();
        let name = q.create_result_queue().await?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let got = q.await_reply(&name, &cancel).await?;
        anyhow::ensure!(got.is_none());
        anyhow::ensure!(!q.is_ready(Some(&name)).await);
        Ok(())
    }

    #[tokio::test]
    async fn expired_reply_queue_rejects_publish() -> anyhow::Result<()> {
        let q = MemoryQueue::new().with_reply_ttl(Duration::from_millis(0));
        let name = q.create_result_queue().await?;
        anyhow::ensure!(q.publish_reply(&name, 7).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn terminal_task_rejects_result_writes() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let node = store.create_subnode("alice", None).await?;
        let (task, subtasks) = store
            .create_task(
                NewRelayTask {
                    id: "job-1".into(),
                    task_type: crate::TaskType::Availability,
                    collection: "c".into(),
                },
                &[node],
            )
            .await?;

        anyhow::ensure!(store.try_complete_task(&task.id).await?.is_some());
        anyhow::ensure!(store.try_complete_task(&task.id).await?.is_none());

        let err = store
            .set_subtask_result(subtasks[0].id, "{}")
            .await
            .expect_err("write after completion must fail");
        anyhow::ensure!(err.is_conflict(), "unexpected error: {err}");

        let stored = store.get_subtask(subtasks[0].id).await?;
        anyhow::ensure!(stored.and_then(|s| s.result).is_none());
        Ok(())
    }
}
