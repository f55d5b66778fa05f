use crate::{backend::connect_state_db, config::HarnessConfig, pgqueue::PgQueue};
use anyhow::Context;
use relay_core::{JobMessage, JobType, TaskQueue};
use serde_json::Value;
use std::path::Path;

/// Job type of a raw payload: anything carrying a `code` is a distribution job.
pub fn infer_job_type(payload: &Value) -> JobType {
    if payload.get("code").is_some() {
        JobType::Distribution
    } else {
        JobType::Availability
    }
}

/// Publish a job read from a JSON file straight onto a SubNode queue.
///
/// Manual testing helper: lets a downstream node be exercised without an upstream.
pub async fn run(
    cfg: &HarnessConfig,
    subnode: &str,
    file: &Path,
    job_type: Option<JobType>,
) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("read job file {}", file.display()))?;
    let payload: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse job file {}", file.display()))?;
    let job_type = job_type.unwrap_or_else(|| infer_job_type(&payload));
    let job = JobMessage::from_upstream(job_type, payload).context("decode job")?;

    let pgq = PgQueue::new(connect_state_db(cfg).await?);
    TaskQueue::publish(&pgq, subnode, &job)
        .await
        .context("publish job")?;

    println!(
        "enqueued {} {} on {subnode}",
        job.type_tag(),
        job.correlation_id()
    );
    Ok(())
}
