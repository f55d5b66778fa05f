use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::AUTHORIZATION, Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use relay_core::{
    lite::memory::{MemoryQueue, MemoryStore},
    JobMessage, JobResult, JobType, QueryResult, RelayStore, TaskQueue,
};
use relay_dispatcher::{
    auth::DownstreamCredentials, router, upstream::JobSource, AppState, BeaconConfig,
    RelayBackends, RelayConfig, RelayServer,
};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tower::util::ServiceExt;

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
        self.submitted.lock().unwrap().push(result.clone());
        Ok(())
    }
}

struct NeverReady;

#[async_trait]
impl TaskQueue for NeverReady {
    async fn publish(&self, _target: &str, _job: &JobMessage) -> relay_core::Result<()> {
        Err(relay_core::Error::BrokerUnavailable("down".into()))
    }

    async fn pop(&self, _target: &str) -> relay_core::Result<Option<JobMessage>> {
        Ok(None)
    }

    async fn is_ready(&self, _queue: Option<&str>) -> bool {
        false
    }
}

struct Fixture {
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    source: Arc<RecordingSource>,
}

fn config() -> anyhow::Result<RelayConfig> {
    Ok(RelayConfig {
        downstream_credentials: DownstreamCredentials::parse(["alice:pw-a", "bob:pw-b"])?,
        beacon: Some(BeaconConfig {
            beacon_id: "relay-beacon".into(),
            reply_timeout: Duration::from_millis(100),
        }),
        ..RelayConfig::default()
    })
}

async fn fixture() -> anyhow::Result<Fixture> {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let source = Arc::new(RecordingSource::default());
    store.create_subnode("alice", Some("node-a")).await?;
    store.create_subnode("bob", Some("node-b")).await?;

    let backends = RelayBackends {
        store: store.clone(),
        queue: queue.clone(),
        replies: queue.clone(),
        upstream: source.clone(),
    };
    let state = Arc::new(AppState::new(config()?, backends));
    Ok(Fixture {
        state,
        store,
        queue,
        source,
    })
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

async fn call(
    state: &Arc<AppState>,
    method: &str,
    uri: &str,
    auth: Option<String>,
    body: Option<String>,
) -> anyhow::Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(AUTHORIZATION, auth);
    }
    let request = builder.body(body.map(Body::from).unwrap_or_else(Body::empty))?;

    let response = router(state.clone()).oneshot(request).await?;
    let status = response.status();
    let bytes = response.into_body().collect().await?.to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, body))
}

async fn dispatch_availability(f: &Fixture, id: &str) -> anyhow::Result<()> {
    let job = JobMessage::from_upstream(
        JobType::Availability,
        json!({"uuid": id, "collection": "RQ-1", "cohort": {}}),
    )?;
    let nodes = f.store.list_subnodes().await?;
    relay_dispatcher::dispatch::TaskDispatcher::new(f.store.clone(), f.queue.clone())
        .dispatch(&job, &nodes)
        .await?;
    Ok(())
}

fn count_result(count: i64) -> String {
    serde_json::to_string(&JobResult::ok(
        "sub",
        "node",
        QueryResult {
            count,
            ..Default::default()
        },
    ))
    .expect("serialize result")
}

#[tokio::test]
async fn downstream_round_trip_completes_task() -> anyhow::Result<()> {
    let f = fixture().await?;
    dispatch_availability(&f, "job-1").await?;

    let mut subtask_ids = Vec::new();
    for (node, user, password) in [("node-a", "alice", "pw-a"), ("node-b", "bob", "pw-b")] {
        let (status, job) = call(
            &f.state,
            "GET",
            &format!("/link_connector_api/task/nextjob/{node}"),
            Some(basic(user, password)),
            None,
        )
        .await?;
        anyhow::ensure!(status == StatusCode::OK, "nextjob status {status}");
        anyhow::ensure!(job["collection"] == node, "subjob addressed to {node}");
        anyhow::ensure!(job["owner"] == user, "subjob owner is {user}");
        let subtask_id = job["uuid"].as_str().unwrap_or_default().to_string();
        subtask_ids.push((subtask_id, node, user, password));
    }

    let (status, body) = call(
        &f.state,
        "GET",
        "/link_connector_api/task/nextjob/node-a",
        Some(basic("alice", "pw-a")),
        None,
    )
    .await?;
    anyhow::ensure!(status == StatusCode::NO_CONTENT, "empty queue status {status}");
    anyhow::ensure!(body.is_null(), "no body on 204");

    for ((subtask_id, node, user, password), count) in subtask_ids.iter().zip([120, 45]) {
        let (status, body) = call(
            &f.state,
            "POST",
            &format!("/link_connector_api/task/result/{subtask_id}/{node}"),
            Some(basic(user, password)),
            Some(count_result(count)),
        )
        .await?;
        anyhow::ensure!(status == StatusCode::OK, "result status {status}: {body}");
    }

    let submitted = f.source.submitted.lock().unwrap().clone();
    anyhow::ensure!(submitted.len() == 1, "one upstream submission");
    anyhow::ensure!(submitted[0].query_result.count == 170, "165 rounds to 170");

    let (subtask_id, node, user, password) = &subtask_ids[0];
    let (status, _) = call(
        &f.state,
        "POST",
        &format!("/link_connector_api/task/result/{subtask_id}/{node}"),
        Some(basic(user, password)),
        Some(count_result(1)),
    )
    .await?;
    anyhow::ensure!(status == StatusCode::CONFLICT, "late result status {status}");
    Ok(())
}

#[tokio::test]
async fn downstream_auth_is_enforced() -> anyhow::Result<()> {
    let f = fixture().await?;
    let uri = "/link_connector_api/task/nextjob/node-a";

    let (status, _) = call(&f.state, "GET", uri, None, None).await?;
    anyhow::ensure!(status == StatusCode::UNAUTHORIZED, "missing creds: {status}");

    let (status, _) = call(&f.state, "GET", uri, Some(basic("alice", "wrong")), None).await?;
    anyhow::ensure!(status == StatusCode::UNAUTHORIZED, "wrong password: {status}");

    let (status, _) = call(&f.state, "GET", uri, Some(basic("bob", "pw-b")), None).await?;
    anyhow::ensure!(status == StatusCode::FORBIDDEN, "foreign node: {status}");

    let (status, _) = call(
        &f.state,
        "GET",
        "/link_connector_api/task/nextjob/node-z",
        Some(basic("alice", "pw-a")),
        None,
    )
    .await?;
    anyhow::ensure!(status == StatusCode::NOT_FOUND, "unknown node: {status}");
    Ok(())
}

#[tokio::test]
async fn result_for_wrong_pair_is_not_found() -> anyhow::Result<()> {
    let f = fixture().await?;
    dispatch_availability(&f, "job-2").await?;
    let Some(job) = f.queue.pop("node-a").await? else {
        anyhow::bail!("no subjob for node-a");
    };
    let subtask_id = job.correlation_id().to_string();

    let (status, _) = call(
        &f.state,
        "POST",
        &format!("/link_connector_api/task/result/{subtask_id}/node-b"),
        Some(basic("bob", "pw-b")),
        Some(count_result(5)),
    )
    .await?;
    anyhow::ensure!(status == StatusCode::NOT_FOUND, "mismatched pair: {status}");

    let (status, _) = call(
        &f.state,
        "POST",
        "/link_connector_api/task/result/not-a-uuid/node-a",
        Some(basic("alice", "pw-a")),
        Some(count_result(5)),
    )
    .await?;
    anyhow::ensure!(status == StatusCode::NOT_FOUND, "bad id: {status}");
    Ok(())
}

#[tokio::test]
async fn beacon_answers_immediately_without_filters_and_times_out_otherwise() -> anyhow::Result<()> {
    let f = fixture().await?;

    let (status, body) = call(&f.state, "GET", "/ga4gh/beacon/v2/individuals", None, None).await?;
    anyhow::ensure!(status == StatusCode::OK, "no filters: {status}");
    anyhow::ensure!(body["meta"]["beaconId"] == "relay-beacon", "beacon id: {body}");
    anyhow::ensure!(body["responseSummary"]["numTotalResults"] == 0, "empty answer");

    // Nobody answers the dispatched subjobs, so the short reply timeout fires.
    let (status, _) = call(
        &f.state,
        "GET",
        "/ga4gh/beacon/v2/individuals?filters=OMOP:8507",
        None,
        None,
    )
    .await?;
    anyhow::ensure!(status == StatusCode::GATEWAY_TIMEOUT, "no answer: {status}");
    anyhow::ensure!(f.queue.depth("node-a") == 1, "subjob was dispatched");
    Ok(())
}

#[tokio::test]
async fn healthz_reports_queue_readiness() -> anyhow::Result<()> {
    let f = fixture().await?;
    let (status, body) = call(&f.state, "GET", "/healthz", None, None).await?;
    anyhow::ensure!(status == StatusCode::OK, "ready: {status}");
    anyhow::ensure!(body["status"] == "ok", "body: {body}");

    let store = Arc::new(MemoryStore::new());
    let replies = Arc::new(MemoryQueue::new());
    let state = Arc::new(AppState::new(
        RelayConfig::default(),
        RelayBackends {
            store,
            queue: Arc::new(NeverReady),
            replies,
            upstream: Arc::new(RecordingSource::default()),
        },
    ));
    let (status, _) = call(&state, "GET", "/healthz", None, None).await?;
    anyhow::ensure!(status == StatusCode::SERVICE_UNAVAILABLE, "not ready: {status}");
    Ok(())
}

#[tokio::test]
async fn server_refuses_to_poll_without_a_ready_queue() -> anyhow::Result<()> {
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    let backends = RelayBackends {
        store: Arc::new(MemoryStore::new()),
        queue: Arc::new(NeverReady),
        replies: Arc::new(MemoryQueue::new()),
        upstream: Arc::new(RecordingSource::default()),
    };

    let err = RelayServer::start(RelayConfig::default(), backends.clone(), bind, true, true)
        .await
        .unwrap_err();
    anyhow::ensure!(
        matches!(
            err.downcast_ref::<relay_core::Error>(),
            Some(relay_core::Error::BrokerUnavailable(_))
        ),
        "unexpected error: {err:#}"
    );

    // Without pollers the HTTP surface still comes up.
    let server = RelayServer::start(RelayConfig::default(), backends, bind, false, true).await?;
    anyhow::ensure!(server.addr.port() != 0, "bound to a real port");
    server.shutdown().await?;
    Ok(())
}
