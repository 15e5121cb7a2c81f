//! Configuration loading and validation.
//!
//! The configuration is a TOML file (default `./config/intake.toml`) parsed
//! into an explicit [`Config`] value that is handed to the orchestrator at
//! construction. Nothing reads configuration from global state; a long-lived
//! process that wants to pick up edits holds a [`ConfigHandle`] and calls
//! [`ConfigHandle::reload`].
//!
//! ```toml
//! [db]
//! path = "./data/intake.sqlite"
//!
//! [storage]
//! input_prefix = "s3://intake/inbox"
//! process_prefix = "s3://intake/processing"
//! reject_prefix = "s3://intake/rejected"
//! tmp_prefix = "s3://intake/tmp"
//!
//! [[pipeline.supported_files]]
//! suffix = "pdf"
//! processor = "index"
//!
//! [classifier]
//! project_id = "acme"
//! location = "eu"
//! processor_id = "forms-v2"
//! endpoint = "https://classifier.internal"
//! labels = ["form", "invoice"]
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::processors::BUILTIN_PROCESSORS;
use crate::storage::Location;
use crate::workspace::sanitize_label;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub classifier: Option<ClassifierConfig>,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub search_index: SearchIndexConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    pub input_prefix: String,
    pub process_prefix: String,
    pub reject_prefix: String,
    #[serde(default)]
    pub tmp_prefix: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| default_region()),
            endpoint_url: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// One entry of the suffix → processor mapping.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SupportedFileType {
    pub suffix: String,
    pub processor: String,
}

impl SupportedFileType {
    fn new(suffix: &str, processor: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            processor: processor.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_supported_files")]
    pub supported_files: Vec<SupportedFileType>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_max_expansion_depth")]
    pub max_expansion_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            supported_files: default_supported_files(),
            exclude_globs: Vec::new(),
            job_timeout_secs: default_job_timeout_secs(),
            max_expansion_depth: default_max_expansion_depth(),
        }
    }
}

fn default_supported_files() -> Vec<SupportedFileType> {
    vec![
        SupportedFileType::new("pdf", "index"),
        SupportedFileType::new("txt", "index"),
        SupportedFileType::new("html", "index"),
        SupportedFileType::new("xlsx", "text-render"),
        SupportedFileType::new("xlsm", "text-render"),
        SupportedFileType::new("zip", "unzip"),
    ]
}
fn default_job_timeout_secs() -> u64 {
    300
}
fn default_max_expansion_depth() -> usize {
    4
}

impl PipelineConfig {
    /// Processor registered for a lowercase extension.
    pub fn processor_for(&self, extension: &str) -> Option<&str> {
        self.supported_files
            .iter()
            .find(|t| t.suffix == extension)
            .map(|t| t.processor.as_str())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Compiled `exclude_globs`.
    pub fn exclude_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_globs {
            builder.add(
                Glob::new(pattern).with_context(|| format!("invalid exclude glob '{}'", pattern))?,
            );
        }
        Ok(builder.build()?)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub processor_id: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_classifier_file_type")]
    pub file_type: String,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
    /// Label → processor. Labels not listed use `text-render`.
    #[serde(default)]
    pub label_processors: BTreeMap<String, String>,
}

fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_classifier_file_type() -> String {
    "pdf".to_string()
}
fn default_classifier_timeout_secs() -> u64 {
    400
}

pub const DEFAULT_LABEL_PROCESSOR: &str = "text-render";

impl ClassifierConfig {
    /// Known labels, trimmed and lowercased.
    pub fn normalized_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|l| l.trim().to_lowercase())
            .collect()
    }

    pub fn processor_for_label(&self, label: &str) -> &str {
        self.label_processors
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(label))
            .map(|(_, v)| v.as_str())
            .unwrap_or(DEFAULT_LABEL_PROCESSOR)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JobsConfig {
    /// Base URL of the external job service. Processors that are not built
    /// in are dispatched here.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchIndexConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            endpoint: None,
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_search_provider() -> String {
    "sqlite".to_string()
}
fn default_search_timeout_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Workspace folders no label may take.
const RESERVED_AREAS: &[&str] = &["classifier-output", "duplicates", "unsupported"];

fn validate(config: &Config) -> Result<()> {
    // Storage prefixes
    let input = parse_prefix("storage.input_prefix", &config.storage.input_prefix)?;
    let process = parse_prefix("storage.process_prefix", &config.storage.process_prefix)?;
    let reject = parse_prefix("storage.reject_prefix", &config.storage.reject_prefix)?;
    let prefixes = [
        ("input_prefix", &input),
        ("process_prefix", &process),
        ("reject_prefix", &reject),
    ];
    for (a_name, a) in &prefixes {
        for (b_name, b) in &prefixes {
            if a_name != b_name && (*a == *b || a.is_within(b)) {
                bail!("storage.{} must not lie inside storage.{}", a_name, b_name);
            }
        }
    }
    if let Some(tmp) = &config.storage.tmp_prefix {
        if !parse_prefix("storage.tmp_prefix", tmp)?.is_remote() {
            bail!("storage.tmp_prefix must be a remote prefix (s3://bucket/key)");
        }
    }

    // Supported files
    let mut seen = HashSet::new();
    for entry in &config.pipeline.supported_files {
        let suffix = entry.suffix.as_str();
        if suffix.is_empty()
            || suffix.contains(['.', '/'])
            || suffix != suffix.to_ascii_lowercase()
        {
            bail!(
                "pipeline.supported_files: suffix '{}' must be a lowercase extension without a dot",
                suffix
            );
        }
        if entry.processor.trim().is_empty() {
            bail!("pipeline.supported_files: suffix '{}' has no processor", suffix);
        }
        if !seen.insert(suffix) {
            bail!("pipeline.supported_files: duplicate suffix '{}'", suffix);
        }
        check_processor(config, &entry.processor)?;
    }
    if config.pipeline.job_timeout_secs == 0 {
        bail!("pipeline.job_timeout_secs must be > 0");
    }
    config.pipeline.exclude_set()?;

    // Classifier
    if let Some(classifier) = &config.classifier {
        for (field, value) in [
            ("project_id", &classifier.project_id),
            ("location", &classifier.location),
            ("processor_id", &classifier.processor_id),
            ("endpoint", &classifier.endpoint),
        ] {
            if value.trim().is_empty() {
                bail!("classifier.{} must be set when [classifier] is present", field);
            }
        }
        let labels = classifier.normalized_labels();
        if labels.is_empty() {
            bail!("classifier.labels must list at least one label");
        }
        let mut unique = HashSet::new();
        let mut folders: HashMap<String, &str> = HashMap::new();
        for label in &labels {
            if label.is_empty() {
                bail!("classifier.labels must not contain empty labels");
            }
            if !unique.insert(label.as_str()) {
                bail!("classifier.labels contains duplicate label '{}'", label);
            }
            let folder = sanitize_label(label);
            if let Some(other) = folders.insert(folder.clone(), label) {
                bail!(
                    "classifier.labels: labels '{}' and '{}' share the folder '{}'",
                    other,
                    label,
                    folder
                );
            }
            // Label areas live next to the type areas in the run workspace
            // and next to the shared areas of the reject workspace.
            let type_output = folder
                .strip_suffix("-output")
                .is_some_and(|ext| config.pipeline.processor_for(ext).is_some());
            if config.pipeline.processor_for(&folder).is_some()
                || type_output
                || RESERVED_AREAS.contains(&folder.as_str())
            {
                bail!(
                    "classifier.labels: label '{}' collides with a workspace area",
                    label
                );
            }
        }
        if !(0.0..=1.0).contains(&classifier.confidence_threshold) {
            bail!("classifier.confidence_threshold must be in [0.0, 1.0]");
        }
        if classifier.file_type.is_empty() || classifier.file_type.contains('.') {
            bail!("classifier.file_type must be an extension without a dot");
        }
        for label in classifier.label_processors.keys() {
            if !unique.contains(label.trim().to_lowercase().as_str()) {
                bail!("classifier.label_processors: unknown label '{}'", label);
            }
        }
        for label in &labels {
            check_processor(config, classifier.processor_for_label(label))?;
        }
    }

    // Search index
    match config.search_index.provider.as_str() {
        "sqlite" | "disabled" => {}
        "http" => {
            if config.search_index.endpoint.is_none() {
                bail!("search_index.endpoint must be set when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown search_index provider: '{}'. Must be sqlite, http, or disabled.",
            other
        ),
    }

    Ok(())
}

fn parse_prefix(field: &str, value: &str) -> Result<Location> {
    Location::parse(value).with_context(|| format!("{} is not a valid storage address", field))
}

fn check_processor(config: &Config, processor: &str) -> Result<()> {
    if config.jobs.endpoint.is_none() && !BUILTIN_PROCESSORS.contains(&processor) {
        bail!(
            "processor '{}' is not built in ({}) and no [jobs] endpoint is configured",
            processor,
            BUILTIN_PROCESSORS.join(", ")
        );
    }
    Ok(())
}

/// A loaded configuration plus the file it came from.
pub struct ConfigHandle {
    path: PathBuf,
    current: Arc<Config>,
    modified: Option<SystemTime>,
}

impl ConfigHandle {
    pub fn open(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: Arc::new(config),
            modified: modified_time(path),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.current.clone()
    }

    /// Re-read the file if its modification time changed. Returns `true`
    /// when a new configuration was installed. An invalid edit leaves the
    /// current configuration in place and returns the error.
    pub fn reload(&mut self) -> Result<bool> {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return Ok(false);
        }
        let config = load_config(&self.path)?;
        self.current = Arc::new(config);
        self.modified = modified;
        Ok(true)
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
