use crate::config::{Backend, HarnessConfig};
use crate::pgqueue::{PgQueue, PgStore};
use anyhow::Context;
use relay_core::lite::memory::{MemoryQueue, MemoryStore};
use relay_dispatcher::{upstream::UpstreamClient, RelayBackends};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};

pub async fn connect_state_db(cfg: &HarnessConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")
}

/// Build the store, queues and upstream client selected by `RELAY_BACKEND`.
pub async fn build(cfg: &HarnessConfig) -> anyhow::Result<RelayBackends> {
    let upstream = Arc::new(
        UpstreamClient::new(
            &cfg.upstream_url,
            cfg.upstream_collection_id.clone(),
            cfg.upstream_username.clone(),
            cfg.upstream_password.clone(),
        )
        .context("init upstream client")?,
    );
    let reply_ttl = Duration::from_secs(cfg.reply_queue_ttl_secs);

    let backends = match cfg.backend {
        Backend::Postgres => {
            let pool = connect_state_db(cfg).await?;
            let queue = Arc::new(PgQueue::new(pool.clone()).with_reply_ttl(reply_ttl));
            RelayBackends {
                store: Arc::new(PgStore::new(pool)),
                queue: queue.clone(),
                replies: queue,
                upstream,
            }
        }
        Backend::Memory => {
            tracing::warn!(
                event = "harness.backend.memory",
                "using in-memory backend; state is lost on exit"
            );
            let queue = Arc::new(MemoryQueue::new().with_reply_ttl(reply_ttl));
            RelayBackends {
                store: Arc::new(MemoryStore::new()),
                queue: queue.clone(),
                replies: queue,
                upstream,
            }
        }
    };
    Ok(backends)
}
