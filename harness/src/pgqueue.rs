#[doc(inline)]
pub use relay_core::lite::pgqueue::PgQueue;
#[doc(inline)]
pub use relay_core::lite::pgstore::PgStore;

#[cfg(test)]
mod tests {
    use super::PgQueue;
    use crate::config::HarnessConfig;
    use anyhow::Context;
    use relay_core::{JobMessage, JobType, ReplyQueue, TaskQueue};
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn queue() -> anyhow::Result<PgQueue> {
        let cfg = HarnessConfig::from_env().context("load harness config")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&cfg.state_database_url)
            .await
            .context("connect state db")?;

        sqlx::migrate!("./migrations/state")
            .run(&pool)
            .await
            .context("migrate state db")?;

        Ok(PgQueue::new(pool).with_reply_poll_interval(Duration::from_millis(20)))
    }

    #[tokio::test]
    #[ignore = "requires STATE_DATABASE_URL"]
    async fn publish_pop_fifo_keeps_type_tag() -> anyhow::Result<()> {
        let pgq = queue().await?;
        let target = format!("pgqueue_test_{}", Uuid::new_v4());

        anyhow::ensure!(pgq.is_ready(None).await, "connection ready");
        anyhow::ensure!(!pgq.is_ready(Some(&target)).await, "queue not declared yet");

        let first = JobMessage::from_upstream(
            JobType::Availability,
            serde_json::json!({"uuid": "a-1", "collection": "c", "cohort": {}}),
        )?;
        let second = JobMessage::from_upstream(
            JobType::Distribution,
            serde_json::json!({"uuid": "b-1", "collection": "c", "code": "GENERIC"}),
        )?;
        TaskQueue::publish(&pgq, &target, &first).await?;
        TaskQueue::publish(&pgq, &target, &second).await?;
        anyhow::ensure!(pgq.is_ready(Some(&target)).await, "queue declared on publish");

        let got = TaskQueue::pop(&pgq, &target).await?;
        anyhow::ensure!(got.as_ref().map(|j| j.correlation_id()) == Some("a-1"));
        anyhow::ensure!(got.map(|j| j.job_type()) == Some(JobType::Availability));

        let got = TaskQueue::pop(&pgq, &target).await?;
        anyhow::ensure!(got.map(|j| j.job_type()) == Some(JobType::Distribution));

        anyhow::ensure!(TaskQueue::pop(&pgq, &target).await?.is_none(), "drained");
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires STATE_DATABASE_URL"]
    async fn reply_queue_delivers_once_then_discards() -> anyhow::Result<()> {
        let pgq = queue().await?;
        let reply = pgq.create_result_queue().await?;
        anyhow::ensure!(relay_core::is_reply_queue(&reply), "reply queue prefix");

        ReplyQueue::publish_reply(&pgq, &reply, 42).await?;
        let got = pgq.await_reply(&reply, &CancellationToken::new()).await?;
        anyhow::ensure!(got == Some(42), "got {got:?}");
        anyhow::ensure!(!pgq.is_ready(Some(&reply)).await, "reply queue discarded");

        let reply = pgq.create_result_queue().await?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let got = pgq.await_reply(&reply, &cancel).await?;
        anyhow::ensure!(got.is_none(), "cancelled wait yields nothing");
        anyhow::ensure!(!pgq.is_ready(Some(&reply)).await, "cancelled reply queue discarded");
        Ok(())
    }
}
