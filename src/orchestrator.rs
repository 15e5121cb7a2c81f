//! Pipeline orchestrator: one batch from input prefix to registry.
//!
//! ```text
//! Listing ─▶ Partitioning ─┬─ no supported files ─▶ Done
//!                          └─▶ DuplicateChecking ─┬─ no survivors ─▶ Done
//!                                                 └─▶ Staging ─▶ ResultsTable
//!   ─▶ Classification (optional) ─▶ Routing
//!   ─▶ { specialized jobs per label ∥ general jobs per type }
//!   ─▶ SearchImport ─▶ RegistryUpdate ─▶ Done
//! ```
//!
//! Per-file problems (a file that cannot be moved, hashed or processed) are
//! recorded in the [`RunSummary`] and never abort the run. Failures of a
//! whole stage return a [`StageError`]; nothing after that stage runs, and
//! since registry entries are only written in the last stage, the files of
//! a failed run are offered again by the next run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::classifier::{Classifier, ClassifyRequest, HttpClassifier};
use crate::config::Config;
use crate::error::{Stage, StageError};
use crate::jobs::{JobDispatcher, JobReport, JobRunner, JobSpec};
use crate::models::{DuplicateMatch, ExistingDocument, RegistryEntry, RejectSidecar};
use crate::processors::ProcessorRegistry;
use crate::progress::{NoProgress, ProgressReporter, RunProgressEvent};
use crate::registry::{detect_duplicates, hash_candidates, DocumentRegistry, SqliteRegistry};
use crate::results::{table_name_for_run, ResultsTable};
use crate::router::ClassifierRouter;
use crate::search_index::{importer_from_config, SearchIndexImporter};
use crate::storage::{Storage, StoragePath};
use crate::workspace::{new_run_id, sanitize_label, sidecar_for, RunWorkspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing to do: no input had a supported type.
    NoSupportedFiles,
    /// Every supported input was a duplicate (or could not be staged).
    NoNewFiles,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClassificationOutcome {
    Skipped { reason: String },
    Completed { routed: usize, labels: Vec<String> },
    /// Classification or routing failed; every file went to general processing.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub processor: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<JobReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSummary {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A file that was left behind by a stage, with the error that stopped it.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Absent when the run short-circuited before creating a workspace.
    pub workspace: Option<String>,
    pub listed: usize,
    pub excluded: usize,
    pub unsupported: Vec<String>,
    pub duplicates: Vec<DuplicateMatch>,
    pub staged: usize,
    pub classification: ClassificationOutcome,
    pub jobs: Vec<JobSummary>,
    pub indexed: u64,
    pub registered: usize,
    pub file_failures: Vec<FileFailure>,
}

impl RunSummary {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            outcome: RunOutcome::Completed,
            workspace: None,
            listed: 0,
            excluded: 0,
            unsupported: Vec::new(),
            duplicates: Vec::new(),
            staged: 0,
            classification: ClassificationOutcome::Skipped {
                reason: "not reached".to_string(),
            },
            jobs: Vec::new(),
            indexed: 0,
            registered: 0,
            file_failures: Vec::new(),
        }
    }

    fn fail_file(&mut self, file: &StoragePath, stage: Stage, error: impl std::fmt::Display) {
        warn!(run_id = %self.run_id, %stage, file = %file, error = %error, "file left behind");
        self.file_failures.push(FileFailure {
            file: file.address(),
            stage,
            error: error.to_string(),
        });
    }
}

/// A candidate moved into the run workspace.
#[derive(Debug, Clone)]
struct StagedFile {
    path: StoragePath,
    extension: String,
    content_hash: String,
}

/// Runs the pipeline against one configuration.
pub struct Orchestrator {
    config: Arc<Config>,
    storage: Storage,
    pool: SqlitePool,
    registry: Arc<dyn DocumentRegistry>,
    classifier: Option<Arc<dyn Classifier>>,
    jobs: Arc<dyn JobRunner>,
    importer: Arc<dyn SearchIndexImporter>,
    progress: Arc<dyn ProgressReporter>,
}

impl Orchestrator {
    /// Collaborators as selected by `config`: SQLite registry, HTTP
    /// classifier if `[classifier]` is set, built-in processors plus the
    /// external job service, and the configured search importer.
    pub fn new(config: Arc<Config>, storage: Storage, pool: SqlitePool) -> Self {
        let classifier = HttpClassifier::from_config(&config)
            .map(|c| Arc::new(c) as Arc<dyn Classifier>);
        let jobs = Arc::new(JobDispatcher::from_config(&config, ProcessorRegistry::builtin()));
        let importer = importer_from_config(&config, pool.clone());
        Self {
            registry: Arc::new(SqliteRegistry::new(pool.clone())),
            classifier,
            jobs,
            importer,
            progress: Arc::new(NoProgress),
            config,
            storage,
            pool,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn DocumentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_classifier(mut self, classifier: Option<Arc<dyn Classifier>>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_jobs(mut self, jobs: Arc<dyn JobRunner>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_importer(mut self, importer: Arc<dyn SearchIndexImporter>) -> Self {
        self.importer = importer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Process everything under the input prefix (or `sub_prefix` below it).
    pub async fn run(&self, sub_prefix: Option<&str>) -> Result<RunSummary, StageError> {
        let run_id = new_run_id();
        self.run_with_id(&run_id, sub_prefix).await
    }

    /// [`run`](Self::run) with a caller-chosen run id. The id must be unique.
    pub async fn run_with_id(&self, run_id: &str, sub_prefix: Option<&str>) -> Result<RunSummary, StageError> {
        let config = &self.config;
        let mut summary = RunSummary::new(run_id);

        let input_root = self
            .storage
            .path(&config.storage.input_prefix)
            .map_err(at(run_id, Stage::Configuration))?;
        let input = match sub_prefix.map(str::trim).filter(|s| !s.is_empty()) {
            Some(sub) => input_root.join(sub),
            None => input_root,
        };
        let process = self
            .storage
            .path(&config.storage.process_prefix)
            .map_err(at(run_id, Stage::Configuration))?;
        let reject = self
            .storage
            .path(&config.storage.reject_prefix)
            .map_err(at(run_id, Stage::Configuration))?;
        let excludes = config
            .pipeline
            .exclude_set()
            .map_err(at(run_id, Stage::Configuration))?;
        let workspace = RunWorkspace::new(run_id, &process, &reject);
        info!(run_id, input = %input, "run started");

        // Listing
        let mut listed = Vec::new();
        let mut lister = input.list();
        while let Some(path) = lister.next().await.map_err(at(run_id, Stage::Listing))? {
            let relative = path
                .relative_to(&input)
                .unwrap_or_else(|| path.name().to_string());
            if excludes.is_match(&relative) {
                summary.excluded += 1;
                continue;
            }
            listed.push((path, relative));
        }
        summary.listed = listed.len();
        self.progress.report(RunProgressEvent::Listing {
            run_id: run_id.to_string(),
            listed: listed.len() as u64,
        });

        // Partitioning
        let mut supported = Vec::new();
        for (path, relative) in listed {
            let extension = path
                .extension()
                .filter(|ext| config.pipeline.processor_for(ext).is_some());
            match extension {
                Some(ext) => supported.push((path, relative, ext)),
                None => {
                    let reason = match path.suffix() {
                        "" => "unsupported type: no extension".to_string(),
                        suffix => format!("unsupported type: {}", suffix),
                    };
                    let dest = workspace.reject_unsupported().join(&relative);
                    let sidecar = RejectSidecar { error_msg: reason };
                    match relocate_with_sidecar(&path, &dest, &sidecar).await {
                        Ok(()) => summary.unsupported.push(path.address()),
                        Err(e) => summary.fail_file(&path, Stage::Partitioning, format!("{:#}", e)),
                    }
                }
            }
        }
        self.progress.report(RunProgressEvent::Partitioned {
            run_id: run_id.to_string(),
            supported: supported.len() as u64,
            unsupported: summary.unsupported.len() as u64,
        });
        if supported.is_empty() {
            info!(run_id, unsupported = summary.unsupported.len(), "no supported files");
            summary.outcome = RunOutcome::NoSupportedFiles;
            summary.classification = ClassificationOutcome::Skipped {
                reason: "no supported files".to_string(),
            };
            return Ok(summary);
        }

        // Duplicate checking: hash everything once, then one registry lookup.
        let mut hashed = Vec::with_capacity(supported.len());
        let paths: Vec<StoragePath> = supported.iter().map(|(p, _, _)| p.clone()).collect();
        for ((path, hash), (_, relative, ext)) in hash_candidates(&paths).await.into_iter().zip(supported) {
            match hash {
                Ok(hash) => hashed.push((path, relative, ext, hash)),
                Err(e) => summary.fail_file(&path, Stage::DuplicateChecking, e),
            }
        }
        let candidates: Vec<StoragePath> = hashed.iter().map(|(p, _, _, _)| p.clone()).collect();
        let mut duplicates = detect_duplicates(self.registry.as_ref(), &candidates)
            .await
            .map_err(at(run_id, Stage::DuplicateChecking))?;
        summary.workspace = Some(workspace.root().address());

        // Repeated content within the batch: the first listed copy is staged,
        // later ones point at its staging address.
        let registered: HashSet<String> = duplicates.iter().map(|d| d.candidate.clone()).collect();
        let mut first_by_hash: HashMap<&str, String> = HashMap::new();
        for (path, relative, ext, hash) in &hashed {
            if registered.contains(&path.address()) {
                continue;
            }
            match first_by_hash.get(hash.as_str()) {
                Some(kept) => duplicates.push(DuplicateMatch {
                    candidate: path.address(),
                    existing: ExistingDocument {
                        uri: kept.clone(),
                        id: String::new(),
                    },
                    content_hash: hash.clone(),
                }),
                None => {
                    first_by_hash.insert(hash, workspace.type_dir(ext).join(relative).address());
                }
            }
        }

        let duplicate_set: HashSet<&str> = duplicates.iter().map(|d| d.candidate.as_str()).collect();
        if !duplicates.is_empty() {
            let report = duplicates
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()
                .map_err(at(run_id, Stage::DuplicateChecking))?
                .join("\n");
            workspace
                .duplicates_report()
                .write_text(&format!("{}\n", report))
                .await
                .map_err(at(run_id, Stage::DuplicateChecking))?;
        }
        let mut survivors = Vec::new();
        for (path, relative, ext, hash) in hashed {
            if !duplicate_set.contains(path.address().as_str()) {
                survivors.push((path, relative, ext, hash));
                continue;
            }
            let Some(found) = duplicates.iter().find(|d| d.candidate == path.address()) else {
                continue;
            };
            let dest = workspace.reject_duplicates().join(&relative);
            if let Err(e) = relocate_with_sidecar(&path, &dest, found).await {
                summary.fail_file(&path, Stage::DuplicateChecking, format!("{:#}", e));
            }
        }
        info!(run_id, duplicates = duplicates.len(), new = survivors.len(), "duplicate check complete");
        self.progress.report(RunProgressEvent::Deduplicated {
            run_id: run_id.to_string(),
            duplicates: duplicates.len() as u64,
            survivors: survivors.len() as u64,
        });
        summary.duplicates = duplicates;

        // Staging
        let mut staged = Vec::new();
        for (path, relative, ext, hash) in survivors {
            let dest = workspace.type_dir(&ext).join(&relative);
            match path.move_to(&dest).await {
                Ok(()) => staged.push(StagedFile {
                    path: dest.with_content_hash(hash.clone()),
                    extension: ext,
                    content_hash: hash,
                }),
                Err(e) => summary.fail_file(&path, Stage::Staging, e),
            }
        }
        summary.staged = staged.len();
        self.progress.report(RunProgressEvent::Staged {
            run_id: run_id.to_string(),
            staged: staged.len() as u64,
        });
        if staged.is_empty() {
            summary.outcome = RunOutcome::NoNewFiles;
            summary.classification = ClassificationOutcome::Skipped {
                reason: "no new files".to_string(),
            };
            info!(run_id, "no new files to process");
            return Ok(summary);
        }

        let table = ResultsTable::new(self.pool.clone(), &table_name_for_run(run_id))
            .map_err(at(run_id, Stage::ResultsTable))?;
        table.create().await.map_err(at(run_id, Stage::ResultsTable))?;

        // Classification and routing
        let labels = self.classify_and_route(&workspace, &mut staged, &mut summary).await;

        // Processing: specialized and general jobs side by side.
        let specs = self.job_specs(&workspace, &staged, &labels);
        summary.jobs = self.run_jobs(run_id, specs, &table).await;

        // Search import
        let rows = table.count().await.map_err(at(run_id, Stage::SearchImport))?;
        if rows > 0 {
            summary.indexed = self
                .importer
                .import(&table)
                .await
                .map_err(at(run_id, Stage::SearchImport))?;
        }

        // Registry update
        let records = table.records().await.map_err(at(run_id, Stage::RegistryUpdate))?;
        let by_address: HashMap<String, &StagedFile> =
            staged.iter().map(|f| (f.path.address(), f)).collect();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for record in &records {
            for uri in record.artifact_uris() {
                let Some(file) = by_address.get(uri) else {
                    continue;
                };
                if seen.insert(file.content_hash.as_str()) {
                    entries.push(RegistryEntry {
                        id: record.id.clone(),
                        file_name: file.path.name().to_string(),
                        uri: uri.to_string(),
                        content_hash: file.content_hash.clone(),
                    });
                }
            }
        }
        summary.registered = self
            .registry
            .register(&entries)
            .await
            .map_err(at(run_id, Stage::RegistryUpdate))?;
        self.progress.report(RunProgressEvent::Registered {
            run_id: run_id.to_string(),
            registered: summary.registered as u64,
        });
        info!(
            run_id,
            staged = summary.staged,
            registered = summary.registered,
            failed_jobs = summary.jobs.iter().filter(|j| !j.succeeded()).count(),
            "run complete"
        );
        Ok(summary)
    }

    /// Classify staged files of the classifier's type and move matches to
    /// their label areas. Returns the labels that received files. Any
    /// failure leaves every file in general processing.
    async fn classify_and_route(
        &self,
        workspace: &RunWorkspace,
        staged: &mut [StagedFile],
        summary: &mut RunSummary,
    ) -> BTreeSet<String> {
        let run_id = workspace.run_id();
        let (Some(settings), Some(classifier)) = (self.config.classifier.as_ref(), self.classifier.as_ref())
        else {
            summary.classification = ClassificationOutcome::Skipped {
                reason: "no classifier configured".to_string(),
            };
            return BTreeSet::new();
        };
        let file_type = settings.file_type.trim_start_matches('.').to_ascii_lowercase();
        let classifiable: Vec<StoragePath> = staged
            .iter()
            .filter(|f| f.extension == file_type)
            .map(|f| f.path.clone())
            .collect();
        if classifiable.is_empty() {
            summary.classification = ClassificationOutcome::Skipped {
                reason: format!("no .{} files staged", file_type),
            };
            return BTreeSet::new();
        }

        let request = ClassifyRequest::new(
            settings,
            workspace.type_dir(&file_type).address(),
            workspace.classifier_output().address(),
        );
        if let Err(e) = classifier.classify(&request, settings.timeout()).await {
            let error = format!("{:#}", e);
            warn!(run_id, stage = %Stage::Classification, %error, "classification failed, using general processing");
            summary.classification = ClassificationOutcome::Failed { error };
            return BTreeSet::new();
        }

        let router = ClassifierRouter::from_config(settings);
        let outcome = match router
            .route(&workspace.classifier_output(), &classifiable, workspace)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(run_id, stage = %Stage::Routing, %error, "routing failed, using general processing");
                summary.classification = ClassificationOutcome::Failed { error };
                return BTreeSet::new();
            }
        };

        for (file, error) in &outcome.failures {
            summary.file_failures.push(FileFailure {
                file: file.clone(),
                stage: Stage::Routing,
                error: error.clone(),
            });
        }
        let moved: HashMap<String, StoragePath> = outcome
            .routed
            .iter()
            .map(|r| (r.from.address(), r.to.clone()))
            .collect();
        for file in staged.iter_mut() {
            if let Some(to) = moved.get(&file.path.address()) {
                file.path = to.clone().with_content_hash(file.content_hash.clone());
            }
        }
        self.progress.report(RunProgressEvent::Classified {
            run_id: run_id.to_string(),
            routed: outcome.routed.len() as u64,
            labels: outcome.labels.iter().cloned().collect(),
        });
        summary.classification = ClassificationOutcome::Completed {
            routed: outcome.routed.len(),
            labels: outcome.labels.iter().cloned().collect(),
        };
        outcome.labels
    }

    /// One job per detected label and one per type with files left in the
    /// general area. Labels nobody matched get no job.
    fn job_specs(&self, workspace: &RunWorkspace, staged: &[StagedFile], labels: &BTreeSet<String>) -> Vec<JobSpec> {
        let mut specs = Vec::new();
        if let Some(settings) = self.config.classifier.as_ref() {
            for label in labels {
                specs.push(JobSpec {
                    name: format!("label-{}", sanitize_label(label)),
                    processor: settings.processor_for_label(label).to_string(),
                    input_prefix: workspace.label_input(label),
                    output_prefix: workspace.label_output(label),
                    reject_prefix: workspace.reject_for(label),
                    metadata: json!({"label": label}),
                });
            }
        }

        let general: BTreeSet<&str> = staged
            .iter()
            .filter(|f| f.path.location().is_within(workspace.type_dir(&f.extension).location()))
            .map(|f| f.extension.as_str())
            .collect();
        for ext in general {
            let Some(processor) = self.config.pipeline.processor_for(ext) else {
                continue;
            };
            specs.push(JobSpec {
                name: format!("general-{}", ext),
                processor: processor.to_string(),
                input_prefix: workspace.type_dir(ext),
                output_prefix: workspace.type_output(ext),
                reject_prefix: workspace.reject_for(ext),
                metadata: json!({}),
            });
        }
        specs
    }

    /// Run every job concurrently, each bounded by the job timeout. A failed
    /// or timed-out job does not affect its siblings.
    async fn run_jobs(&self, run_id: &str, specs: Vec<JobSpec>, table: &ResultsTable) -> Vec<JobSummary> {
        let timeout = self.config.pipeline.job_timeout();
        let total = specs.len() as u64;
        let mut tasks = JoinSet::new();
        for (idx, spec) in specs.iter().cloned().enumerate() {
            let runner = self.jobs.clone();
            let table = table.clone();
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, runner.run(&spec, &table)).await {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => Err(format!("{:#}", e)),
                    Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
                };
                (idx, result)
            });
        }

        let mut results: Vec<Option<Result<JobReport, String>>> = specs.iter().map(|_| None).collect();
        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            let (idx, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(run_id, error = %e, "job task aborted");
                    continue;
                }
            };
            done += 1;
            let spec = &specs[idx];
            match &result {
                Ok(report) => info!(run_id, job = %spec.name, rows = report.rows, rejected = report.rejected, "job finished"),
                Err(e) => warn!(run_id, job = %spec.name, stage = %Stage::Processing, error = %e, "job failed"),
            }
            self.progress.report(RunProgressEvent::JobFinished {
                run_id: run_id.to_string(),
                job: spec.name.clone(),
                rows: result.as_ref().map(|r| r.rows).unwrap_or(0),
                ok: result.is_ok(),
                done,
                total,
            });
            results[idx] = Some(result);
        }

        specs
            .into_iter()
            .zip(results)
            .map(|(spec, result)| {
                let result = result.unwrap_or_else(|| Err("job task aborted".to_string()));
                let (report, error) = match result {
                    Ok(report) => (Some(report), None),
                    Err(e) => (None, Some(e)),
                };
                JobSummary {
                    name: spec.name,
                    processor: spec.processor,
                    input: spec.input_prefix.address(),
                    report,
                    error,
                }
            })
            .collect()
    }
}

fn at<E: Into<anyhow::Error>>(run_id: &str, stage: Stage) -> impl FnOnce(E) -> StageError + '_ {
    move |e| StageError::new(run_id, stage, e)
}

/// Move `path` to `dest` and write `sidecar` as `<dest>.json`.
async fn relocate_with_sidecar<T: Serialize>(path: &StoragePath, dest: &StoragePath, sidecar: &T) -> anyhow::Result<()> {
    path.move_to(dest).await?;
    sidecar_for(dest)
        .write_text(&serde_json::to_string(sidecar)?)
        .await?;
    Ok(())
}
