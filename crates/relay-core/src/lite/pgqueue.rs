use crate::{Error, JobMessage, ReplyQueue, Result, TaskQueue, REPLY_QUEUE_PREFIX};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REPLY_TAG: &str = "reply";

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
    reply_ttl: Duration,
    reply_poll_interval: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            reply_ttl: Duration::from_secs(600),
            reply_poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_reply_ttl(mut self, ttl: Duration) -> Self {
        self.reply_ttl = ttl;
        self
    }

    pub fn with_reply_poll_interval(mut self, interval: Duration) -> Self {
        self.reply_poll_interval = interval;
        self
    }

    pub async fn publish(&self, target: &str, job: &JobMessage) -> Result<()> {
        let payload = job.to_payload()?;
        let mut tx = self.pool.begin().await.context("begin pgqueue publish")?;

        sqlx::query(
            r#"
            INSERT INTO relay.queues (name, expires_at)
            VALUES ($1, NULL)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(target)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("pgqueue declare queue={target}"))?;

        self.insert_message(&mut tx, target, job.type_tag(), payload)
            .await?;

        tx.commit().await.context("commit pgqueue publish")?;
        Ok(())
    }

    pub async fn pop(&self, target: &str) -> Result<Option<JobMessage>> {
        let Some((tag, payload)) = self.pop_raw(target).await? else {
            return Ok(None);
        };
        JobMessage::from_parts(&tag, payload).map(Some)
    }

    pub async fn is_ready(&self, queue: Option<&str>) -> bool {
        let res: anyhow::Result<bool> = async {
            match queue {
                None => {
                    sqlx::query("SELECT 1")
                        .execute(&self.pool)
                        .await
                        .context("pgqueue ping")?;
                    Ok(true)
                }
                Some(name) => {
                    let exists: bool = sqlx::query_scalar(
                        r#"
                        SELECT EXISTS (
                          SELECT 1
                          FROM relay.queues
                          WHERE name = $1
                            AND (expires_at IS NULL OR expires_at > now())
                        )
                        "#,
                    )
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await
                    .with_context(|| format!("pgqueue check queue={name}"))?;
                    Ok(exists)
                }
            }
        }
        .await;

        match res {
            Ok(ready) => ready,
            Err(err) => {
                tracing::warn!(
                    event = "relay.pgqueue.not_ready",
                    error = %err,
                    "pgqueue readiness check failed"
                );
                false
            }
        }
    }

    pub async fn create_result_queue(&self) -> Result<String> {
        self.purge_expired_reply_queues().await?;

        let name = format!("{REPLY_QUEUE_PREFIX}{}", Uuid::new_v4());
        let ttl_millis = duration_millis(self.reply_ttl);
        sqlx::query(
            r#"
            INSERT INTO relay.queues (name, expires_at)
            VALUES ($1, now() + ($2::text || ' milliseconds')::interval)
            "#,
        )
        .bind(&name)
        .bind(ttl_millis)
        .execute(&self.pool)
        .await
        .with_context(|| format!("pgqueue create reply queue={name}"))?;

        Ok(name)
    }

    pub async fn publish_reply(&self, queue: &str, value: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin pgqueue reply")?;

        let live = sqlx::query(
            r#"
            SELECT 1
            FROM relay.queues
            WHERE name = $1
              AND expires_at > now()
            FOR UPDATE
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("pgqueue lock reply queue={queue}"))?
        .is_some();

        if !live {
            return Err(Error::not_found("reply queue", queue));
        }

        self.insert_message(&mut tx, queue, REPLY_TAG, Value::from(value))
            .await?;
        tx.commit().await.context("commit pgqueue reply")?;
        Ok(())
    }

    pub async fn await_reply(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<i64>> {
        let res = loop {
            match self.pop_raw(queue).await {
                Ok(Some((tag, payload))) => {
                    if tag != REPLY_TAG {
                        break Err(Error::UnsupportedType(format!("reply message tag {tag}")));
                    }
                    break payload
                        .as_i64()
                        .map(Some)
                        .ok_or_else(|| Error::msg(format!("reply on {queue} is not an integer")));
                }
                Ok(None) => {}
                Err(err) => break Err(err),
            }

            tokio::select! {
                _ = cancel.cancelled() => break Ok(None),
                _ = tokio::time::sleep(self.reply_poll_interval) => {}
            }
        };

        if let Err(err) = self.delete_queue(queue).await {
            tracing::warn!(
                event = "relay.pgqueue.reply_discard.error",
                queue = %queue,
                error = %err,
                "failed to discard reply queue"
            );
        }

        res
    }

    async fn insert_message(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        queue: &str,
        type_tag: &str,
        payload: Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay.queue_messages (message_id, queue_name, type_tag, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue)
        .bind(type_tag)
        .bind(payload)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("pgqueue publish to queue={queue}"))?;
        Ok(())
    }

    async fn pop_raw(&self, queue: &str) -> Result<Option<(String, Value)>> {
        let row = sqlx::query(
            r#"
            WITH picked AS (
              SELECT message_id
              FROM relay.queue_messages
              WHERE queue_name = $1
              ORDER BY created_at
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            DELETE FROM relay.queue_messages AS m
            USING picked
            WHERE m.message_id = picked.message_id
            RETURNING m.type_tag, m.payload
            "#,
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("pgqueue pop from queue={queue}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tag: String = row.try_get("type_tag")?;
        let payload: Value = row.try_get("payload")?;
        Ok(Some((tag, payload)))
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin pgqueue discard")?;
        sqlx::query("DELETE FROM relay.queue_messages WHERE queue_name = $1")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .context("pgqueue discard messages")?;
        sqlx::query("DELETE FROM relay.queues WHERE name = $1")
            .bind(queue)
            .execute(&mut *tx)
            .await
            .context("pgqueue discard queue")?;
        tx.commit().await.context("commit pgqueue discard")?;
        Ok(())
    }

    async fn purge_expired_reply_queues(&self) -> Result<()> {
        sqlx::query(
            r#"
            WITH expired AS (
              DELETE FROM relay.queues
              WHERE expires_at IS NOT NULL
                AND expires_at <= now()
              RETURNING name
            )
            DELETE FROM relay.queue_messages AS m
            USING expired
            WHERE m.queue_name = expired.name
            "#,
        )
        .execute(&self.pool)
        .await
        .context("pgqueue purge expired reply queues")?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    async fn publish(&self, target: &str, job: &JobMessage) -> Result<()> {
        self.publish(target, job).await
    }

    async fn pop(&self, target: &str) -> Result<Option<JobMessage>> {
        self.pop(target).await
    }

    async fn is_ready(&self, queue: Option<&str>) -> bool {
        self.is_ready(queue).await
    }
}

#[async_trait]
impl ReplyQueue for PgQueue {
    async fn create_result_queue(&self) -> Result<String> {
        self.create_result_queue().await
    }

    async fn publish_reply(&self, queue: &str, value: i64) -> Result<()> {
        self.publish_reply(queue, value).await
    }

    async fn await_reply(&self, queue: &str, cancel: &CancellationToken) -> Result<Option<i64>> {
        self.await_reply(queue, cancel).await
    }
}

fn duration_millis(d: Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}
