//! Relay dispatcher service.
//!
//! Fans upstream jobs out to downstream SubNode queues, collects their results, and returns one
//! obfuscated aggregate per job. Downstream nodes talk to the HTTP surface built here; upstream
//! jobs arrive through the pollers spawned by [`RelayServer`].

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay_core::{
    Error, JobType, Obfuscator, RelayStore, ReplyQueue, SubNode, TaskQueue,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod aggregate;
pub mod auth;
pub mod bridge;
pub mod collector;
pub mod dispatch;
pub mod poller;
pub mod upstream;

use aggregate::AggregatorRegistry;
use auth::{AuthFailure, DownstreamCredentials};
use bridge::{parse_omop_filters, BeaconResponse, BridgeAnswer, SyncBridge};
use collector::{CollectorSettings, ResultCollector};
use dispatch::TaskDispatcher;
use poller::{PollerSettings, UpstreamPoller};
use upstream::JobSource;

#[derive(Clone, Debug)]
pub struct BeaconConfig {
    pub beacon_id: String,
    pub reply_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub obfuscator: Obfuscator,
    pub collector: CollectorSettings,
    pub expiry_sweep_interval: Duration,
    pub poller: PollerSettings,
    /// Upstream queues to poll, one loop each.
    pub upstream_job_types: Vec<JobType>,
    /// `None` disables the Beacon endpoint.
    pub beacon: Option<BeaconConfig>,
    pub downstream_credentials: DownstreamCredentials,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            obfuscator: Obfuscator::default(),
            collector: CollectorSettings::default(),
            expiry_sweep_interval: Duration::from_secs(30),
            poller: PollerSettings::default(),
            upstream_job_types: JobType::ALL.to_vec(),
            beacon: None,
            downstream_credentials: DownstreamCredentials::default(),
        }
    }
}

/// External collaborators the relay runs against.
#[derive(Clone)]
pub struct RelayBackends {
    pub store: Arc<dyn RelayStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub replies: Arc<dyn ReplyQueue>,
    pub upstream: Arc<dyn JobSource>,
}

pub struct AppState {
    cfg: RelayConfig,
    store: Arc<dyn RelayStore>,
    queue: Arc<dyn TaskQueue>,
    collector: Arc<ResultCollector>,
    poller: UpstreamPoller,
    bridge: SyncBridge,
    /// Cancelled when the server shuts down; parents every Beacon wait.
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(cfg: RelayConfig, backends: RelayBackends) -> Self {
        let dispatcher = TaskDispatcher::new(backends.store.clone(), backends.queue.clone());
        let collector = Arc::new(ResultCollector::new(
            backends.store.clone(),
            backends.replies.clone(),
            backends.upstream.clone(),
            AggregatorRegistry::with_defaults(),
            cfg.obfuscator,
            cfg.collector.clone(),
        ));
        let poller = UpstreamPoller::new(
            backends.store.clone(),
            backends.upstream.clone(),
            dispatcher.clone(),
            cfg.poller,
        );
        let reply_timeout = cfg
            .beacon
            .as_ref()
            .map_or(Duration::from_secs(60), |b| b.reply_timeout);
        let bridge = SyncBridge::new(
            backends.store.clone(),
            backends.replies.clone(),
            dispatcher,
            reply_timeout,
        );

        Self {
            cfg,
            store: backends.store,
            queue: backends.queue,
            collector,
            poller,
            bridge,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn collector(&self) -> &Arc<ResultCollector> {
        &self.collector
    }

    pub fn poller(&self) -> &UpstreamPoller {
        &self.poller
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }
}

#[derive(Debug)]
pub struct RelayServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl RelayServer {
    /// Bind the HTTP surface and spawn the background loops.
    ///
    /// Pollers start only after the queue backend passes its readiness check; otherwise this fails
    /// with [`Error::BrokerUnavailable`] rather than pulling jobs that cannot be delivered.
    pub async fn start(
        cfg: RelayConfig,
        backends: RelayBackends,
        bind: SocketAddr,
        enable_pollers: bool,
        enable_expiry_sweep: bool,
    ) -> anyhow::Result<Self> {
        if enable_pollers && !backends.queue.is_ready(None).await {
            return Err(Error::BrokerUnavailable("queue readiness check failed".to_string()).into());
        }
        if !cfg.downstream_credentials.is_enabled() {
            tracing::warn!(
                event = "relay.server.auth.disabled",
                "no downstream credentials configured; downstream endpoints are unauthenticated"
            );
        }

        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind relay to {bind}"))?;
        let addr = listener.local_addr().context("relay local_addr")?;

        let state = Arc::new(AppState::new(cfg, backends));
        let app = router(state.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_relay(
            listener,
            app,
            state,
            shutdown_tx.clone(),
            shutdown_rx,
            enable_pollers,
            enable_expiry_sweep,
        ));

        tracing::info!(event = "relay.server.started", %addr, "relay listening");
        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join relay task")??;
        Ok(())
    }
}

async fn run_relay(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    enable_pollers: bool,
    enable_expiry_sweep: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_pollers {
        for job_type in state.cfg.upstream_job_types.iter().copied() {
            let poller = state.poller.clone();
            let rx = shutdown_rx.clone();
            bg.push(tokio::spawn(async move { poller.run(job_type, rx).await }));
        }
    }
    if enable_expiry_sweep {
        bg.push(tokio::spawn(collector::expiry_sweep_loop(
            state.collector.clone(),
            state.cfg.expiry_sweep_interval,
            shutdown_rx.clone(),
        )));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let cancel = state.shutdown.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
            // Release Beacon requests still waiting on a reply so the drain can finish.
            cancel.cancel();
        });

    let server_res = server.await;
    let _ = shutdown_tx.send(true);
    state.shutdown.cancel();

    for h in bg {
        match h.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                event = "relay.server.background.error",
                error = %err,
                "background loop failed"
            ),
            Err(err) => tracing::warn!(
                event = "relay.server.background.join_error",
                error = %err,
                "background loop panicked"
            ),
        }
    }

    server_res.context("relay serve")?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/link_connector_api/task/nextjob/:subnode_id",
            get(next_job),
        )
        .route(
            "/link_connector_api/task/result/:subtask_id/:subnode_id",
            post(submit_result),
        )
        .route("/ga4gh/beacon/v2/individuals", get(beacon_individuals))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if state.queue.is_ready(None).await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
    } else {
        ApiError::unavailable("queue backend unavailable").into_response()
    }
}

async fn next_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(subnode_id): Path<String>,
) -> ApiResult<Response> {
    let subnode = authorize_subnode(&state, &headers, &subnode_id).await?;

    let job = state
        .queue
        .pop(&subnode.id)
        .await
        .map_err(ApiError::internal)?;
    let Some(job) = job else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    tracing::debug!(
        event = "relay.api.nextjob.delivered",
        subnode_id = %subnode.id,
        subtask_id = %job.correlation_id(),
        "delivered subjob"
    );
    let payload = job.to_payload().map_err(ApiError::internal)?;
    Ok(Json(payload).into_response())
}

async fn submit_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((subtask_id, subnode_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let subnode = authorize_subnode(&state, &headers, &subnode_id).await?;

    let subtask_id =
        Uuid::parse_str(&subtask_id).map_err(|_| ApiError::not_found("unknown subtask"))?;
    let subtask = state
        .store
        .get_subtask(subtask_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("unknown subtask"))?;
    if subtask.owner != subnode.id {
        return Err(ApiError::not_found("unknown subtask"));
    }

    let raw = String::from_utf8(body.to_vec())
        .map_err(|_| ApiError::bad_request("result must be utf-8"))?;

    let outcome = state
        .collector
        .submit_subtask_result(subtask_id, &raw)
        .await
        .map_err(ApiError::from_relay)?;

    Ok(Json(serde_json::json!({
        "subtask_id": outcome.subtask.id,
        "task_id": outcome.subtask.relay_task_id,
        "task_completed": outcome.completion.is_some(),
    })))
}

#[derive(Debug, Deserialize)]
struct BeaconQuery {
    #[serde(default)]
    filters: Option<String>,
}

async fn beacon_individuals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BeaconQuery>,
) -> ApiResult<Json<BeaconResponse>> {
    let Some(beacon) = state.cfg.beacon.as_ref() else {
        return Err(ApiError::not_found("beacon disabled"));
    };

    let concept_ids = parse_omop_filters(query.filters.as_deref().unwrap_or_default());
    let cancel = state.shutdown.child_token();
    // Cancels the wait if the client goes away and the handler future is dropped.
    let _guard = cancel.clone().drop_guard();

    let answer = state
        .bridge
        .query(&concept_ids, &cancel)
        .await
        .map_err(ApiError::internal)?;

    match answer {
        BridgeAnswer::NotApplicable => Ok(Json(BeaconResponse::count(&beacon.beacon_id, 0))),
        BridgeAnswer::Count(count) => Ok(Json(BeaconResponse::count(&beacon.beacon_id, count))),
        BridgeAnswer::NoAnswer => Err(ApiError::gateway_timeout("no answer from relay")),
    }
}

/// Resolve the SubNode named in the path and check the caller may act for it.
async fn authorize_subnode(
    state: &AppState,
    headers: &HeaderMap,
    subnode_id: &str,
) -> ApiResult<SubNode> {
    let user = state
        .cfg
        .downstream_credentials
        .authenticate(headers)
        .map_err(|failure| match failure {
            AuthFailure::Missing => ApiError::unauthorized("missing credentials"),
            AuthFailure::Invalid => ApiError::unauthorized("invalid credentials"),
        })?;

    let subnode = state
        .store
        .get_subnode(subnode_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("unknown subnode"))?;

    if let Some(user) = user {
        if user != subnode.owner {
            tracing::warn!(
                event = "relay.api.auth.forbidden",
                subnode_id = %subnode.id,
                user = %user,
                "caller does not own subnode"
            );
            return Err(ApiError::forbidden("subnode not owned by caller"));
        }
    }

    Ok(subnode)
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn unauthorized(message: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message,
        }
    }

    fn forbidden(message: &'static str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message,
        }
    }

    fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn conflict(message: &'static str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message,
        }
    }

    fn unavailable(message: &'static str) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message,
        }
    }

    fn gateway_timeout(message: &'static str) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message,
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "relay.api.internal_error",
            error = %err,
            "relay internal error"
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error",
        }
    }

    fn from_relay(err: Error) -> Self {
        match err {
            Error::NotFound { .. } => Self::not_found("unknown subtask"),
            Error::Conflict(_) => Self::conflict("task already completed"),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
