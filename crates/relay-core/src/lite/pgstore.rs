use crate::{
    Error, NewRelayTask, RelayStore, RelaySubTask, RelayTask, Result, SubNode, TaskType,
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

/// Postgres-backed [`RelayStore`]. Schema lives in `harness/migrations/state`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn task_from_row(row: &PgRow) -> Result<RelayTask> {
    let task_type: String = row.try_get("task_type")?;
    Ok(RelayTask {
        id: row.try_get("id")?,
        task_type: task_type.parse::<TaskType>()?,
        collection: row.try_get("collection")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn subtask_from_row(row: &PgRow) -> Result<RelaySubTask> {
    Ok(RelaySubTask {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        relay_task_id: row.try_get("relay_task_id")?,
        result: row.try_get("result")?,
    })
}

fn subnode_from_row(row: &PgRow) -> Result<SubNode> {
    Ok(SubNode {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
    })
}

#[async_trait]
impl RelayStore for PgStore {
    async fn create_task(
        &self,
        task: NewRelayTask,
        owners: &[SubNode],
    ) -> Result<(RelayTask, Vec<RelaySubTask>)> {
        let mut tx = self.pool.begin().await.context("begin create task tx")?;

        let row = sqlx::query(
            r#"
            INSERT INTO relay.relay_tasks (id, task_type, collection)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            RETURNING id, task_type, collection, created_at, completed_at
            "#,
        )
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(&task.collection)
        .fetch_optional(&mut *tx)
        .await
        .with_context(|| format!("insert relay task id={}", task.id))?;

        let Some(row) = row else {
            return Err(Error::Conflict(format!("task {} already exists", task.id)));
        };
        let created = task_from_row(&row)?;

        let mut subtasks = Vec::with_capacity(owners.len());
        for owner in owners {
            let row = sqlx::query(
                r#"
                INSERT INTO relay.relay_subtasks (id, owner, relay_task_id)
                VALUES ($1, $2, $3)
                RETURNING id, owner, relay_task_id, result
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&owner.id)
            .bind(&task.id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("insert subtask for task={} owner={}", task.id, owner.id))?;
            subtasks.push(subtask_from_row(&row)?);
        }

        tx.commit().await.context("commit create task tx")?;
        Ok((created, subtasks))
    }

    async fn get_task(&self, id: &str) -> Result<Option<RelayTask>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_type, collection, created_at, completed_at
            FROM relay.relay_tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("select relay task")?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_subtask(&self, id: Uuid) -> Result<Option<RelaySubTask>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, relay_task_id, result
            FROM relay.relay_subtasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("select relay subtask")?;

        row.as_ref().map(subtask_from_row).transpose()
    }

    async fn list_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, relay_task_id, result
            FROM relay.relay_subtasks
            WHERE relay_task_id = $1
            ORDER BY owner, id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("select subtasks")?;

        rows.iter().map(subtask_from_row).collect()
    }

    async fn list_incomplete_subtasks(&self, task_id: &str) -> Result<Vec<RelaySubTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, relay_task_id, result
            FROM relay.relay_subtasks
            WHERE relay_task_id = $1
              AND result IS NULL
            ORDER BY owner, id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("select incomplete subtasks")?;

        rows.iter().map(subtask_from_row).collect()
    }

    async fn list_incomplete_tasks(&self) -> Result<Vec<RelayTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_type, collection, created_at, completed_at
            FROM relay.relay_tasks
            WHERE completed_at IS NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("select incomplete tasks")?;

        rows.iter().map(task_from_row).collect()
    }

    async fn set_subtask_result(&self, id: Uuid, result: &str) -> Result<RelaySubTask> {
        let mut tx = self.pool.begin().await.context("begin subtask result tx")?;

        let task_id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT relay_task_id
            FROM relay.relay_subtasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("select subtask parent")?;

        let Some(task_id) = task_id else {
            return Err(Error::not_found("subtask", id.to_string()));
        };

        // Row lock on the parent serialises result writes against the terminal transition.
        let completed_at: Option<Option<chrono::DateTime<chrono::Utc>>> = sqlx::query_scalar(
            r#"
            SELECT completed_at
            FROM relay.relay_tasks
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(&task_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock parent task")?;

        match completed_at {
            None => return Err(Error::not_found("task", task_id)),
            Some(Some(_)) => {
                return Err(Error::Conflict(format!("task {task_id} is already complete")))
            }
            Some(None) => {}
        }

        let row = sqlx::query(
            r#"
            UPDATE relay.relay_subtasks
            SET result = $2
            WHERE id = $1
            RETURNING id, owner, relay_task_id, result
            "#,
        )
        .bind(id)
        .bind(result)
        .fetch_one(&mut *tx)
        .await
        .context("update subtask result")?;
        let subtask = subtask_from_row(&row)?;

        tx.commit().await.context("commit subtask result tx")?;
        Ok(subtask)
    }

    async fn try_complete_task(&self, id: &str) -> Result<Option<RelayTask>> {
        let row = sqlx::query(
            r#"
            UPDATE relay.relay_tasks
            SET completed_at = now()
            WHERE id = $1
              AND completed_at IS NULL
            RETURNING id, task_type, collection, created_at, completed_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("complete relay task")?;

        if let Some(row) = row {
            return task_from_row(&row).map(Some);
        }

        match self.get_task(id).await? {
            Some(_) => Ok(None),
            None => Err(Error::not_found("task", id)),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM relay.relay_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete relay task")?;
        Ok(())
    }

    async fn create_subnode(&self, owner: &str, id: Option<&str>) -> Result<SubNode> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let row = sqlx::query(
            r#"
            INSERT INTO relay.subnodes (id, owner)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET owner = EXCLUDED.owner
            RETURNING id, owner
            "#,
        )
        .bind(&id)
        .bind(owner)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upsert subnode id={id}"))?;

        subnode_from_row(&row)
    }

    async fn get_subnode(&self, id: &str) -> Result<Option<SubNode>> {
        let row = sqlx::query("SELECT id, owner FROM relay.subnodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("select subnode")?;

        row.as_ref().map(subnode_from_row).transpose()
    }

    async fn list_subnodes(&self) -> Result<Vec<SubNode>> {
        let rows = sqlx::query("SELECT id, owner FROM relay.subnodes ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .context("select subnodes")?;

        rows.iter().map(subnode_from_row).collect()
    }

    async fn delete_subnode(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM relay.subnodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete subnode")?;
        Ok(res.rows_affected() > 0)
    }
}
