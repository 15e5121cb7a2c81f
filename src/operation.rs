//! Long-running, polled operations on external services.
//!
//! The classification service, the external job service and the HTTP search
//! importer all follow the same protocol: a `POST` starts work and returns
//! an operation resource `{name, done, error?, metadata?}`; the caller polls
//! `GET {base}/v1/{name}` until `done` is true, then checks `error`. Waiting
//! is bounded by a timeout; an operation still running when it expires is
//! treated as failed.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub metadata: Value,
}

/// HTTP client for one operation-style service.
#[derive(Clone)]
pub struct OperationClient {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl OperationClient {
    pub fn new(base_url: &str, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST {base}{path}` with a JSON body; returns the started operation.
    pub async fn start(&self, path: &str, body: &Value) -> Result<OperationStatus> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "{} returned HTTP {}: {}",
                url,
                status,
                text.chars().take(500).collect::<String>()
            );
        }
        resp.json()
            .await
            .with_context(|| format!("{} returned an invalid operation", url))
    }

    async fn poll(&self, name: &str) -> Result<OperationStatus> {
        let url = format!("{}/v1/{}", self.base_url, name);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("polling {} failed", url))?;
        if !resp.status().is_success() {
            bail!("polling {} returned HTTP {}", url, resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Poll until the operation is done or `timeout` elapses. A finished
    /// operation carrying an `error` is returned as an error.
    pub async fn wait(&self, operation: OperationStatus, timeout: Duration) -> Result<OperationStatus> {
        let name = operation.name.clone();
        let finished = tokio::time::timeout(timeout, async {
            let mut current = operation;
            while !current.done {
                tokio::time::sleep(self.poll_interval).await;
                current = self.poll(&current.name).await?;
                debug!(operation = %current.name, done = current.done, "polled operation");
            }
            Ok::<_, anyhow::Error>(current)
        })
        .await;

        let status = match finished {
            Ok(result) => result?,
            Err(_) => bail!(
                "operation {} did not finish within {}s",
                name,
                timeout.as_secs()
            ),
        };
        if let Some(err) = &status.error {
            bail!("operation {} failed: {}", status.name, err.message);
        }
        Ok(status)
    }

    /// [`start`](Self::start) followed by [`wait`](Self::wait).
    pub async fn run(&self, path: &str, body: &Value, timeout: Duration) -> Result<OperationStatus> {
        let started = self.start(path, body).await?;
        self.wait(started, timeout).await
    }
}
