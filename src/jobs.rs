//! Extraction jobs: one invocation per staged type or routed label.
//!
//! A job reads every file under its input prefix, writes derived objects
//! under its output prefix, moves files it cannot process to its reject
//! prefix with a `{"error_msg"}` sidecar, and writes one results-table row
//! per indexed object. Jobs of one run touch disjoint prefixes and disjoint
//! rows, so they run concurrently without coordination.
//!
//! Processors registered in-process run through [`LocalJobRunner`]; any
//! other processor name is sent to the external job service by
//! [`HttpJobRunner`]. [`JobDispatcher`] picks between them.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{Config, PipelineConfig, SupportedFileType};
use crate::operation::OperationClient;
use crate::processors::{expand_root, Expansion, ProcessorRegistry, RootResult};
use crate::results::ResultsTable;
use crate::storage::StoragePath;

/// Parameters of one job invocation.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique within the run, e.g. `general-pdf` or `label-invoice`.
    pub name: String,
    pub processor: String,
    pub input_prefix: StoragePath,
    pub output_prefix: StoragePath,
    pub reject_prefix: StoragePath,
    /// Merged into every record's metadata.
    pub metadata: Value,
}

/// What a finished job did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub rows: u64,
    pub processed: u64,
    pub rejected: u64,
    /// `(file, error)` for files the job could not handle and could not reject.
    pub failures: Vec<(String, String)>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, spec: &JobSpec, table: &ResultsTable) -> Result<JobReport>;
}

/// Runs registered processors in-process.
#[derive(Clone)]
pub struct LocalJobRunner {
    processors: ProcessorRegistry,
    supported: Vec<SupportedFileType>,
    max_depth: usize,
}

impl LocalJobRunner {
    pub fn new(processors: ProcessorRegistry, pipeline: &PipelineConfig) -> Self {
        Self {
            processors,
            supported: pipeline.supported_files.clone(),
            max_depth: pipeline.max_expansion_depth,
        }
    }

    pub fn handles(&self, processor: &str) -> bool {
        self.processors.contains(processor)
    }

    fn processor_for(&self, extension: &str) -> Option<String> {
        self.supported
            .iter()
            .find(|t| t.suffix == extension)
            .map(|t| t.processor.clone())
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn run(&self, spec: &JobSpec, table: &ResultsTable) -> Result<JobReport> {
        if !self.handles(&spec.processor) {
            bail!("processor '{}' is not registered", spec.processor);
        }
        let lookup = |ext: &str| self.processor_for(ext);
        let expansion = Expansion {
            registry: &self.processors,
            processor_for: &lookup,
            max_depth: self.max_depth,
            input_root: &spec.input_prefix,
            reject_dir: &spec.reject_prefix,
            extra_metadata: spec.metadata.clone(),
        };

        let mut report = JobReport::default();
        let roots = spec
            .input_prefix
            .list()
            .collect_all()
            .await
            .with_context(|| format!("failed to list {}", spec.input_prefix))?;

        for root in roots {
            match expand_root(&root, &spec.processor, &spec.output_prefix, &expansion).await {
                Ok(RootResult::Records(records)) => {
                    report.rows += table.insert(&spec.name, &records).await? as u64;
                    report.processed += 1;
                }
                Ok(RootResult::Rejected { reason }) => {
                    info!(job = %spec.name, file = %root, %reason, "file rejected");
                    report.rejected += 1;
                }
                Err(e) => {
                    warn!(job = %spec.name, file = %root, error = %e, "file failed");
                    report.failures.push((root.address(), format!("{:#}", e)));
                }
            }
        }
        Ok(report)
    }
}

/// Invokes the external job service at `{endpoint}/v1/jobs/{processor}:run`.
pub struct HttpJobRunner {
    ops: OperationClient,
    timeout: Duration,
}

impl HttpJobRunner {
    pub fn new(ops: OperationClient, timeout: Duration) -> Self {
        Self { ops, timeout }
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn run(&self, spec: &JobSpec, table: &ResultsTable) -> Result<JobReport> {
        let body = json!({
            "inputPrefix": spec.input_prefix.address(),
            "outputPrefix": spec.output_prefix.address(),
            "rejectPrefix": spec.reject_prefix.address(),
            "outputMetadataTable": table.name(),
            "job": spec.name,
            "metadata": spec.metadata,
        });
        let op = self
            .ops
            .run(&format!("/v1/jobs/{}:run", spec.processor), &body, self.timeout)
            .await
            .with_context(|| format!("job {} failed", spec.name))?;

        let count = |key: &str| op.metadata.get(key).and_then(Value::as_u64).unwrap_or(0);
        Ok(JobReport {
            rows: count("rows"),
            processed: count("processed"),
            rejected: count("rejected"),
            failures: Vec::new(),
        })
    }
}

/// Local processors first, the external service for everything else.
pub struct JobDispatcher {
    local: LocalJobRunner,
    remote: Option<HttpJobRunner>,
}

impl JobDispatcher {
    pub fn new(local: LocalJobRunner, remote: Option<HttpJobRunner>) -> Self {
        Self { local, remote }
    }

    pub fn from_config(config: &Config, processors: ProcessorRegistry) -> Self {
        let remote = config.jobs.endpoint.as_deref().map(|endpoint| {
            HttpJobRunner::new(
                OperationClient::new(endpoint, Duration::from_millis(config.jobs.poll_interval_ms)),
                config.pipeline.job_timeout(),
            )
        });
        Self::new(LocalJobRunner::new(processors, &config.pipeline), remote)
    }
}

#[async_trait]
impl JobRunner for JobDispatcher {
    async fn run(&self, spec: &JobSpec, table: &ResultsTable) -> Result<JobReport> {
        if self.local.handles(&spec.processor) {
            return self.local.run(spec, table).await;
        }
        match &self.remote {
            Some(remote) => remote.run(spec, table).await,
            None => bail!(
                "no runner for processor '{}': not built in and jobs.endpoint is not set",
                spec.processor
            ),
        }
    }
}
