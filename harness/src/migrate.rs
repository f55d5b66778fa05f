use crate::{backend::connect_state_db, config::HarnessConfig};
use anyhow::Context;

/// Apply the relay state schema (tasks, subtasks, SubNodes, queues).
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let state_pool = connect_state_db(cfg).await?;

    sqlx::migrate!("./migrations/state")
        .run(&state_pool)
        .await
        .context("migrate state db")?;

    tracing::info!(event = "harness.migrate.complete", "migrations complete");
    Ok(())
}
