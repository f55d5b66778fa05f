//! Synchronous request, asynchronous answer: blocks an inbound query on the relay fan-in.
//!
//! The bridge allocates a reply queue, dispatches a synthetic availability job whose collection
//! is that queue's name, and waits for the collector to publish the aggregated count there.

use crate::dispatch::TaskDispatcher;
use relay_core::{
    job::AvailabilityJob, JobMessage, RelayStore, ReplyQueue, Result,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const OMOP_PREFIX: &str = "OMOP:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeAnswer {
    /// Nothing to ask: no usable filter or no SubNode registered. Nothing was dispatched.
    NotApplicable,
    /// The wait was cancelled or timed out before a reply arrived.
    NoAnswer,
    Count(i64),
}

#[derive(Clone)]
pub struct SyncBridge {
    store: Arc<dyn RelayStore>,
    replies: Arc<dyn ReplyQueue>,
    dispatcher: TaskDispatcher,
    reply_timeout: Duration,
}

impl SyncBridge {
    pub fn new(
        store: Arc<dyn RelayStore>,
        replies: Arc<dyn ReplyQueue>,
        dispatcher: TaskDispatcher,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            store,
            replies,
            dispatcher,
            reply_timeout,
        }
    }

    /// Ask every SubNode how many individuals match all `concept_ids`.
    ///
    /// `cancel` is the caller's own cancellation; the configured reply timeout applies on top.
    pub async fn query(&self, concept_ids: &[String], cancel: &CancellationToken) -> Result<BridgeAnswer> {
        if concept_ids.is_empty() {
            return Ok(BridgeAnswer::NotApplicable);
        }
        let targets = self.store.list_subnodes().await?;
        if targets.is_empty() {
            return Ok(BridgeAnswer::NotApplicable);
        }

        let queue = self.replies.create_result_queue().await?;
        let job = synthetic_job(&queue, concept_ids);
        let outcome = self.dispatcher.dispatch(&job, &targets).await?;

        // Timeout goes through the token so the reply queue is discarded on every path.
        let wait = cancel.child_token();
        let timer = tokio::spawn({
            let wait = wait.clone();
            let timeout = self.reply_timeout;
            async move {
                tokio::time::sleep(timeout).await;
                wait.cancel();
            }
        });
        let reply = self.replies.await_reply(&queue, &wait).await;
        timer.abort();

        match reply? {
            Some(count) => Ok(BridgeAnswer::Count(count)),
            None => {
                tracing::info!(
                    event = "relay.bridge.no_answer",
                    task_id = %outcome.task.id,
                    reply_queue = %queue,
                    "no reply before cancellation"
                );
                Ok(BridgeAnswer::NoAnswer)
            }
        }
    }
}

/// Concept ids named by a comma-separated Beacon `filters` value. Non-OMOP terms are ignored.
pub fn parse_omop_filters(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for term in raw.split(',') {
        let term = term.trim();
        let Some(prefix) = term.get(..OMOP_PREFIX.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(OMOP_PREFIX) {
            continue;
        }
        let id = term[OMOP_PREFIX.len()..].trim();
        if id.is_empty() || ids.iter().any(|existing| existing == id) {
            continue;
        }
        ids.push(id.to_string());
    }
    ids
}

/// Availability job whose collection is the reply queue: one group, every concept required.
fn synthetic_job(reply_queue: &str, concept_ids: &[String]) -> JobMessage {
    let rules: Vec<Value> = concept_ids
        .iter()
        .map(|id| {
            json!({
                "type": "OMOP",
                "varname": "OMOP",
                "oper": "=",
                "value": id,
            })
        })
        .collect();

    JobMessage::Availability(AvailabilityJob {
        uuid: Uuid::new_v4().to_string(),
        collection: reply_queue.to_string(),
        owner: String::new(),
        cohort: json!({
            "groups_operator": "OR",
            "groups": [{ "id": 1, "rules_operator": "AND", "rules": rules }],
        }),
        extra: Map::new(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconMeta {
    pub beacon_id: String,
    pub api_version: &'static str,
    pub returned_granularity: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconSummary {
    pub exists: bool,
    pub num_total_results: i64,
}

/// Count-granularity Beacon v2 response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconResponse {
    pub meta: BeaconMeta,
    pub response_summary: BeaconSummary,
}

impl BeaconResponse {
    pub fn count(beacon_id: &str, count: i64) -> Self {
        Self {
            meta: BeaconMeta {
                beacon_id: beacon_id.to_string(),
                api_version: "v2.0.0",
                returned_granularity: "count",
            },
            response_summary: BeaconSummary {
                exists: count > 0,
                num_total_results: count,
            },
        }
    }
}
