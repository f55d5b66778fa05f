//! Postgres-backed relay checks. Run with `STATE_DATABASE_URL` set and `--ignored`.

use anyhow::Context;
use async_trait::async_trait;
use relay_core::{
    Error, JobMessage, JobResult, JobType, NewRelayTask, QueryResult, RelayStore, TaskType,
};
use relay_dispatcher::{upstream::JobSource, RelayBackends, RelayConfig, RelayServer};
use relay_harness::{
    config::HarnessConfig,
    migrate,
    pgqueue::{PgQueue, PgStore},
};
use sqlx::postgres::PgPoolOptions;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

async fn migrated_store() -> anyhow::Result<PgStore> {
    let cfg = HarnessConfig::from_env().context("load harness config")?;
    migrate::run(&cfg).await.context("run migrations")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;
    Ok(PgStore::new(pool))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn new_task(id: &str) -> NewRelayTask {
    NewRelayTask {
        id: id.to_string(),
        task_type: TaskType::Availability,
        collection: "RQ-CC-1".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires STATE_DATABASE_URL"]
async fn task_lifecycle_is_compare_and_set() -> anyhow::Result<()> {
    let store = migrated_store().await?;
    let node = store.create_subnode("alice", Some(&unique("node"))).await?;
    let task_id = unique("task");

    let (task, subtasks) = store.create_task(new_task(&task_id), &[node.clone()]).await?;
    anyhow::ensure!(task.completed_at.is_none(), "new task is open");
    anyhow::ensure!(subtasks.len() == 1 && subtasks[0].owner == node.id, "one subtask");

    let err = store
        .create_task(new_task(&task_id), &[node.clone()])
        .await
        .unwrap_err();
    anyhow::ensure!(err.is_conflict(), "duplicate task id conflicts, got {err}");

    store.set_subtask_result(subtasks[0].id, "{}").await?;
    anyhow::ensure!(store.list_incomplete_subtasks(&task_id).await?.is_empty());

    let (first, second) = tokio::join!(
        store.try_complete_task(&task_id),
        store.try_complete_task(&task_id)
    );
    let winners = [first?, second?].iter().filter(|t| t.is_some()).count();
    anyhow::ensure!(winners == 1, "exactly one completion, got {winners}");

    let err = store
        .set_subtask_result(subtasks[0].id, "{}")
        .await
        .unwrap_err();
    anyhow::ensure!(err.is_conflict(), "terminal task rejects results, got {err}");

    store.delete_task(&task_id).await?;
    anyhow::ensure!(store.get_subtask(subtasks[0].id).await?.is_none(), "cascade delete");
    store.delete_subnode(&node.id).await?;
    Ok(())
}

#[derive(Default)]
struct RecordingSource {
    submitted: Mutex<Vec<JobResult>>,
}

#[async_trait]
impl JobSource for RecordingSource {
    async fn next_job(&self, _job_type: JobType) -> relay_core::Result<Option<JobMessage>> {
        Ok(None)
    }

    async fn submit_result(&self, result: &JobResult) -> relay_core::Result<()> {
        self.submitted
            .lock()
            .map_err(|_| Error::msg("poisoned"))?
            .push(result.clone());
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires STATE_DATABASE_URL"]
async fn relay_round_trip_over_postgres() -> anyhow::Result<()> {
    let store = migrated_store().await?;
    let pool = store.pool().clone();
    let node_id = unique("node");
    store.create_subnode("alice", Some(&node_id)).await?;

    let source = Arc::new(RecordingSource::default());
    let queue = Arc::new(PgQueue::new(pool.clone()));
    let backends = RelayBackends {
        store: Arc::new(store.clone()),
        queue: queue.clone(),
        replies: queue,
        upstream: source.clone(),
    };
    let server = RelayServer::start(
        RelayConfig::default(),
        backends.clone(),
        "127.0.0.1:0".parse::<SocketAddr>()?,
        false,
        false,
    )
    .await?;

    let job_id = unique("job");
    let job = JobMessage::from_upstream(
        JobType::Availability,
        serde_json::json!({"uuid": job_id, "collection": "RQ-CC-1", "cohort": {}}),
    )?;
    let nodes = vec![store
        .get_subnode(&node_id)
        .await?
        .context("declared node")?];
    relay_dispatcher::dispatch::TaskDispatcher::new(backends.store.clone(), backends.queue.clone())
        .dispatch(&job, &nodes)
        .await?;

    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let subjob: serde_json::Value = client
        .get(format!("{base}/link_connector_api/task/nextjob/{node_id}"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let subtask_id = subjob["uuid"].as_str().context("subjob uuid")?.to_string();

    let result = JobResult::ok(
        subtask_id.clone(),
        node_id.clone(),
        QueryResult {
            count: 57,
            ..Default::default()
        },
    );
    let response = client
        .post(format!(
            "{base}/link_connector_api/task/result/{subtask_id}/{node_id}"
        ))
        .json(&result)
        .send()
        .await?;
    anyhow::ensure!(response.status().is_success(), "result status {}", response.status());

    let submitted = source
        .submitted
        .lock()
        .map_err(|_| anyhow::anyhow!("poisoned"))?
        .clone();
    anyhow::ensure!(submitted.len() == 1, "one upstream submission");
    anyhow::ensure!(submitted[0].uuid == job_id, "reported under the parent job id");
    anyhow::ensure!(submitted[0].query_result.count == 60, "57 rounds to 60");

    let task = store.get_task(&job_id).await?.context("task persisted")?;
    anyhow::ensure!(task.completed_at.is_some(), "task terminal");

    tokio::time::timeout(Duration::from_secs(5), server.shutdown()).await??;
    store.delete_task(&job_id).await?;
    store.delete_subnode(&node_id).await?;
    Ok(())
}
