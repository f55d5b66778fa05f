//! Long-running pull loops against the upstream job source, one per job type.

use crate::{
    dispatch::{DispatchOutcome, TaskDispatcher},
    upstream::JobSource,
};
use relay_core::{JobType, RelayStore, Result};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    /// Delay between fetches in milliseconds. Zero polls back-to-back; negative makes a single
    /// fetch attempt and stops, whether it yields a job, nothing, or an error. The attempt waits
    /// until a SubNode is registered.
    pub frequency_ms: i64,
    /// Wait after an error, or while no SubNode is registered.
    pub error_backoff: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            frequency_ms: 1_000,
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing was fetched because no SubNode could receive it.
    NoSubNodes,
    Empty,
    Dispatched(DispatchOutcome),
}

#[derive(Clone)]
pub struct UpstreamPoller {
    store: Arc<dyn RelayStore>,
    source: Arc<dyn JobSource>,
    dispatcher: TaskDispatcher,
    settings: PollerSettings,
}

impl UpstreamPoller {
    pub fn new(
        store: Arc<dyn RelayStore>,
        source: Arc<dyn JobSource>,
        dispatcher: TaskDispatcher,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            source,
            dispatcher,
            settings,
        }
    }

    /// One fetch-and-dispatch cycle.
    pub async fn poll_once(&self, job_type: JobType) -> Result<PollOutcome> {
        if self.store.list_subnodes().await?.is_empty() {
            return Ok(PollOutcome::NoSubNodes);
        }

        let Some(job) = self.source.next_job(job_type).await? else {
            return Ok(PollOutcome::Empty);
        };

        // Registration may have changed while the fetch was in flight.
        let targets = self.store.list_subnodes().await?;
        if targets.is_empty() {
            tracing::warn!(
                event = "relay.poller.no_targets",
                job_type = %job_type,
                task_id = %job.correlation_id(),
                "job fetched after all SubNodes were removed; it will close on expiry"
            );
        }

        let outcome = self.dispatcher.dispatch(&job, &targets).await?;
        Ok(PollOutcome::Dispatched(outcome))
    }

    /// Poll until `shutdown_rx` flips. Errors are logged and followed by the backoff; they only
    /// end the loop in single-fetch mode (negative frequency).
    pub async fn run(
        &self,
        job_type: JobType,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            event = "relay.poller.started",
            job_type = %job_type,
            frequency_ms = self.settings.frequency_ms,
            "upstream poller started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let outcome = self.poll_once(job_type).await;
            let fetch_attempted = !matches!(outcome, Ok(PollOutcome::NoSubNodes));
            let delay = match outcome {
                Ok(PollOutcome::NoSubNodes) => {
                    tracing::debug!(
                        event = "relay.poller.idle",
                        job_type = %job_type,
                        "no SubNodes registered; not polling"
                    );
                    self.settings.error_backoff
                }
                Ok(_) => Duration::from_millis(self.settings.frequency_ms.unsigned_abs()),
                Err(err) => {
                    tracing::warn!(
                        event = "relay.poller.error",
                        job_type = %job_type,
                        error = %err,
                        "poll cycle failed"
                    );
                    self.settings.error_backoff
                }
            };

            if fetch_attempted && self.settings.frequency_ms < 0 {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            event = "relay.poller.stopped",
            job_type = %job_type,
            "upstream poller stopped"
        );
        Ok(())
    }
}
