//! Boundary to the external document classification service.
//!
//! The service takes an input prefix and an output location, classifies
//! every file under the prefix asynchronously, and writes one or more JSON
//! fragment files per input under the output location. Each fragment holds
//! `{"entities": [{"type", "confidence", "id"}]}`. Reading the fragments is
//! the router's job ([`crate::router`]).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::config::{ClassifierConfig, Config};
use crate::operation::OperationClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifyRequest {
    pub project_scope: String,
    pub location_scope: String,
    pub processor_id: String,
    pub input_prefix: String,
    pub output_uri: String,
}

impl ClassifyRequest {
    pub fn new(config: &ClassifierConfig, input_prefix: String, output_uri: String) -> Self {
        Self {
            project_scope: config.project_id.clone(),
            location_scope: config.location.clone(),
            processor_id: config.processor_id.clone(),
            input_prefix,
            output_uri,
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify every file under `request.input_prefix`, returning once the
    /// fragments are written to `request.output_uri`.
    async fn classify(&self, request: &ClassifyRequest, timeout: Duration) -> Result<()>;
}

/// Classifier reached over HTTP as a polled batch operation.
pub struct HttpClassifier {
    ops: OperationClient,
}

impl HttpClassifier {
    pub fn new(ops: OperationClient) -> Self {
        Self { ops }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        config.classifier.as_ref().map(|c| {
            Self::new(OperationClient::new(
                &c.endpoint,
                Duration::from_millis(config.jobs.poll_interval_ms),
            ))
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, request: &ClassifyRequest, timeout: Duration) -> Result<()> {
        let path = format!(
            "/v1/projects/{}/locations/{}/processors/{}:batchProcess",
            request.project_scope, request.location_scope, request.processor_id
        );
        let body = json!({
            "inputPrefix": request.input_prefix,
            "outputUri": request.output_uri,
        });
        let op = self
            .ops
            .run(&path, &body, timeout)
            .await
            .with_context(|| format!("classification of {} failed", request.input_prefix))?;
        info!(operation = %op.name, input = %request.input_prefix, "classification finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_camel_case() {
        let req = ClassifyRequest {
            project_scope: "acme".into(),
            location_scope: "eu".into(),
            processor_id: "forms".into(),
            input_prefix: "s3://b/run/pdf".into(),
            output_uri: "s3://b/run/classifier-output".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["projectScope"], "acme");
        assert_eq!(v["outputUri"], "s3://b/run/classifier-output");
    }
}
