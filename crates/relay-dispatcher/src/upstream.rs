//! Client for the upstream job source.

use anyhow::Context;
use async_trait::async_trait;
use relay_core::{Error, JobMessage, JobResult, JobType, Result};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::fmt;

/// Pull-style source of upstream jobs and sink for final answers.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Fetch the next job of `job_type`, if any.
    async fn next_job(&self, job_type: JobType) -> Result<Option<JobMessage>>;

    /// Submit a final answer keyed by `result.uuid` and `result.collection_id`.
    ///
    /// `Conflict` means the job was already finalized upstream.
    async fn submit_result(&self, result: &JobResult) -> Result<()>;
}

#[derive(Clone)]
pub struct UpstreamClient {
    base_url: Url,
    collection_id: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url.as_str())
            .field("collection_id", &self.collection_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(
        base_url: &str,
        collection_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut base = base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).with_context(|| format!("parse upstream url {base_url}"))?;

        Ok(Self {
            base_url,
            collection_id: collection_id.into(),
            username: username.into(),
            password: password.into(),
            http: reqwest::Client::new(),
        })
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("join upstream url {path}"))
    }
}

#[async_trait]
impl JobSource for UpstreamClient {
    async fn next_job(&self, job_type: JobType) -> Result<Option<JobMessage>> {
        let path = format!(
            "link_connector_api/task/nextjob/{}.{}",
            self.collection_id,
            job_type.suffix()
        );
        let url = self.url(&path)?;
        let resp = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("GET {path}"))?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::msg(format!("upstream nextjob returned {status}")));
        }

        let payload: Value = resp.json().await.context("decode upstream job")?;
        if payload.is_null() {
            return Ok(None);
        }
        JobMessage::from_upstream(job_type, payload).map(Some)
    }

    async fn submit_result(&self, result: &JobResult) -> Result<()> {
        let path = format!(
            "link_connector_api/task/result/{}/{}",
            result.uuid, result.collection_id
        );
        let url = self.url(&path)?;
        let resp = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(result)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;

        let status = resp.status();
        if status == StatusCode::CONFLICT {
            return Err(Error::Conflict(format!("job {} already finalized", result.uuid)));
        }
        if !status.is_success() {
            return Err(Error::UpstreamSubmission {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
