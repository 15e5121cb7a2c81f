//! Error types shared across the pipeline.
//!
//! Storage operations return the typed [`StorageError`]. Stage-level failures
//! of a run are reported as [`StageError`], which carries the run id, the
//! stage and (when known) the file or job that triggered it, so an operator
//! can re-run only the affected slice.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors emitted by [`StoragePath`](crate::storage::StoragePath) operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid storage address `{0}`")]
    InvalidAddress(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote storage error: {0}")]
    Remote(String),

    #[error("remote storage rejected request: {0}")]
    Rejected(String),

    #[error("{operation} on {address} gave up after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: &'static str,
        address: String,
        attempts: u32,
        message: String,
    },

    #[error("no remote object store available for {0}")]
    NoRemoteStore(String),

    #[error("storage.tmp_prefix must name a remote prefix to stage {0} as an object")]
    NoTempPrefix(String),
}

impl StorageError {
    pub(crate) fn io(path: impl fmt::Display, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return StorageError::NotFound(path.to_string());
        }
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Pipeline stages, in causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configuration,
    Listing,
    Partitioning,
    DuplicateChecking,
    Staging,
    ResultsTable,
    Classification,
    Routing,
    Processing,
    SearchImport,
    RegistryUpdate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configuration => "configuration",
            Stage::Listing => "listing",
            Stage::Partitioning => "partitioning",
            Stage::DuplicateChecking => "duplicate-checking",
            Stage::Staging => "staging",
            Stage::ResultsTable => "results-table",
            Stage::Classification => "classification",
            Stage::Routing => "routing",
            Stage::Processing => "processing",
            Stage::SearchImport => "search-import",
            Stage::RegistryUpdate => "registry-update",
        };
        f.write_str(name)
    }
}

/// A stage of a run failed; nothing after this stage was attempted.
#[derive(Debug, Error)]
#[error(
    "run {run_id} failed at {stage}{}: {source:#}",
    .subject.as_deref().map(|s| format!(" ({s})")).unwrap_or_default()
)]
pub struct StageError {
    pub run_id: String,
    pub stage: Stage,
    pub subject: Option<String>,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn new(run_id: &str, stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage,
            subject: None,
            source: source.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}
