//! End-to-end runs of the orchestrator over local directories, plus one
//! over the in-memory object store.
//!
//! Each local test gets its own temp root with `in/`, `processing/`, `rejected/`
//! and a file-backed SQLite database, so runs behave exactly as the CLI's.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use doc_intake::classifier::{Classifier, ClassifyRequest};
use doc_intake::config::{parse_config, Config};
use doc_intake::db;
use doc_intake::error::Stage;
use doc_intake::jobs::{JobReport, JobRunner, JobSpec, LocalJobRunner};
use doc_intake::migrate::migrate_pool;
use doc_intake::models::RegistryEntry;
use doc_intake::orchestrator::{ClassificationOutcome, Orchestrator, RunOutcome};
use doc_intake::processors::ProcessorRegistry;
use doc_intake::registry::{DocumentRegistry, SqliteRegistry};
use doc_intake::results::{table_name_for_run, ResultsTable};
use doc_intake::search_index::SearchIndexImporter;
use doc_intake::storage::{MemoryStore, Storage};

const RUN_1: &str = "docs-processing-01-01-2026-aaaa0001";
const RUN_2: &str = "docs-processing-01-01-2026-aaaa0002";

struct Env {
    _tmp: TempDir,
    root: std::path::PathBuf,
    config: Arc<Config>,
    pool: SqlitePool,
}

impl Env {
    async fn new(extra: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        std::fs::create_dir_all(root.join("in")).unwrap();
        let toml = format!(
            r#"[db]
path = "{root}/data/intake.sqlite"

[storage]
input_prefix = "{root}/in"
process_prefix = "{root}/processing"
reject_prefix = "{root}/rejected"

{extra}
"#,
            root = root.display(),
            extra = extra
        );
        let config = parse_config(&toml).unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        Self {
            _tmp: tmp,
            root,
            config: Arc::new(config),
            pool,
        }
    }

    fn input(&self, name: &str, body: &[u8]) {
        let path = self.root.join("in").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn path(&self, relative: &str) -> std::path::PathBuf {
        self.root.join(relative)
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.config.clone(), Storage::local(), self.pool.clone())
    }

    fn registry(&self) -> SqliteRegistry {
        SqliteRegistry::new(self.pool.clone())
    }

    async fn hash_of(&self, body: &[u8]) -> String {
        let scratch = self.root.join("scratch.bin");
        std::fs::write(&scratch, body).unwrap();
        let hash = Storage::local().local_path(&scratch).content_hash().await.unwrap();
        std::fs::remove_file(scratch).unwrap();
        hash
    }
}

fn files_under(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_string_lossy().to_string())
        .collect()
}

#[tokio::test]
async fn new_duplicate_and_unsupported_files() {
    let env = Env::new("").await;
    env.input("a.pdf", b"%PDF-1.4 alpha");
    env.input("b.pdf", b"%PDF-1.4 beta");
    env.input("c.xyz", b"???");

    let hash_a = env.hash_of(b"%PDF-1.4 alpha").await;
    let hash_b = env.hash_of(b"%PDF-1.4 beta").await;
    env.registry()
        .register(&[RegistryEntry {
            id: "id-existing".to_string(),
            file_name: "b.pdf".to_string(),
            uri: "/archive/b.pdf".to_string(),
            content_hash: hash_b.clone(),
        }])
        .await
        .unwrap();

    let summary = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.listed, 3);
    assert_eq!(summary.unsupported.len(), 1);
    assert_eq!(summary.duplicates.len(), 1);
    assert_eq!(summary.staged, 1);
    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.registered, 1);
    assert!(summary.file_failures.is_empty());

    // The input location is left clean.
    assert!(files_under(&env.path("in")).is_empty());

    // c.xyz: unsupported, with a reason sidecar.
    let reject = env.path(&format!("rejected/{}", RUN_1));
    assert!(reject.join("unsupported/c.xyz").exists());
    let sidecar: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(reject.join("unsupported/c.xyz.json")).unwrap()).unwrap();
    assert_eq!(sidecar["error_msg"], "unsupported type: .xyz");

    // b.pdf: duplicate, sidecar references the existing entry.
    assert!(reject.join("duplicates/b.pdf").exists());
    let sidecar: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(reject.join("duplicates/b.pdf.json")).unwrap()).unwrap();
    assert_eq!(sidecar["existing_doc"]["id"], "id-existing");
    assert_eq!(sidecar["existing_doc"]["uri"], "/archive/b.pdf");
    let report = std::fs::read_to_string(env.path(&format!("processing/{}/duplicates/result.jsonl", RUN_1))).unwrap();
    assert_eq!(report.lines().count(), 1);

    // a.pdf: staged, processed and registered once with a fresh id.
    let staged = env.path(&format!("processing/{}/pdf/a.pdf", RUN_1));
    assert!(staged.exists());
    let registry = env.registry();
    assert_eq!(registry.count().await.unwrap(), 2);
    let found = registry
        .lookup(&[hash_a.clone()].into_iter().collect())
        .await
        .unwrap();
    let entry = &found[&hash_a];
    assert!(entry.id.starts_with("id-"));
    assert_ne!(entry.id, "id-existing");
    assert_eq!(entry.file_name, "a.pdf");
    assert_eq!(entry.uri, staged.display().to_string());

    let table = ResultsTable::new(env.pool.clone(), &table_name_for_run(RUN_1)).unwrap();
    let records = table.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, entry.id);
    assert_eq!(records[0].content.mime_type, "application/pdf");
}

#[tokio::test]
async fn second_run_on_same_content_registers_nothing() {
    let env = Env::new("").await;
    env.input("a.pdf", b"%PDF-1.4 alpha");
    env.input("notes/n.txt", b"plain notes");

    let first = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    assert_eq!(first.registered, 2);

    env.input("a.pdf", b"%PDF-1.4 alpha");
    env.input("notes/n.txt", b"plain notes");
    let second = env.orchestrator().run_with_id(RUN_2, None).await.unwrap();
    assert_eq!(second.outcome, RunOutcome::NoNewFiles);
    assert_eq!(second.duplicates.len(), 2);
    assert_eq!(second.registered, 0);
    assert_eq!(env.registry().count().await.unwrap(), 2);
    assert!(env
        .path(&format!("rejected/{}/duplicates/notes/n.txt.json", RUN_2))
        .exists());
    assert!(!env.path(&format!("processing/{}/pdf", RUN_2)).exists());
}

#[tokio::test]
async fn empty_input_is_a_no_op() {
    let env = Env::new("").await;
    let summary = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::NoSupportedFiles);
    assert!(summary.workspace.is_none());
    assert!(!env.path("processing").exists());
    assert_eq!(env.registry().count().await.unwrap(), 0);
}

#[tokio::test]
async fn only_unsupported_files_creates_no_workspace() {
    let env = Env::new("").await;
    env.input("photo.heic", b"....");
    env.input("README", b"no extension");

    let summary = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::NoSupportedFiles);
    assert_eq!(summary.unsupported.len(), 2);
    assert!(!env.path("processing").exists());
    let sidecar = std::fs::read_to_string(env.path(&format!("rejected/{}/unsupported/README.json", RUN_1))).unwrap();
    assert!(sidecar.contains("no extension"));
}

#[tokio::test]
async fn sub_prefix_and_exclude_globs_scope_the_run() {
    let env = Env::new("[pipeline]\nexclude_globs = [\"**/skip-*\"]").await;
    env.input("batch-1/a.txt", b"one");
    env.input("batch-1/skip-me.txt", b"excluded");
    env.input("batch-2/b.txt", b"other batch");

    let summary = env.orchestrator().run_with_id(RUN_1, Some("batch-1")).await.unwrap();
    assert_eq!(summary.listed, 1);
    assert_eq!(summary.excluded, 1);
    assert_eq!(summary.registered, 1);
    assert!(env.path("in/batch-1/skip-me.txt").exists());
    assert!(env.path("in/batch-2/b.txt").exists());
}

/// Writes one fragment per staged file; `a` is an invoice, everything else
/// gets a low-confidence guess.
struct FragmentWriter;

#[async_trait]
impl Classifier for FragmentWriter {
    async fn classify(&self, request: &ClassifyRequest, _timeout: Duration) -> Result<()> {
        let storage = Storage::local();
        let input = storage.path(&request.input_prefix)?;
        let output = storage.path(&request.output_uri)?;
        for file in input.list().collect_all().await? {
            let confidence = if file.stem() == "a" { 0.92 } else { 0.4 };
            let body = serde_json::json!({
                "entities": [{"type": "Invoice", "confidence": confidence, "id": "0"}]
            });
            output
                .join(&format!("{}-0.json", file.stem()))
                .write_text(&body.to_string())
                .await?;
        }
        Ok(())
    }
}

struct Unavailable;

#[async_trait]
impl Classifier for Unavailable {
    async fn classify(&self, _request: &ClassifyRequest, _timeout: Duration) -> Result<()> {
        Err(anyhow!("service unavailable"))
    }
}

const CLASSIFIER: &str = r#"[classifier]
project_id = "acme"
location = "eu"
processor_id = "forms"
endpoint = "http://127.0.0.1:9"
labels = ["invoice", "form"]

[classifier.label_processors]
invoice = "index"
"#;

#[tokio::test]
async fn classified_files_go_to_their_label_job() {
    let env = Env::new(CLASSIFIER).await;
    env.input("a.pdf", b"%PDF-1.4 invoice");
    env.input("b.pdf", b"%PDF-1.4 letter");
    env.input("n.txt", b"text is never classified");

    let summary = env
        .orchestrator()
        .with_classifier(Some(Arc::new(FragmentWriter)))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();

    match &summary.classification {
        ClassificationOutcome::Completed { routed, labels } => {
            assert_eq!(*routed, 1);
            assert_eq!(labels, &vec!["invoice".to_string()]);
        }
        other => panic!("unexpected classification outcome {:?}", other),
    }
    let mut jobs: Vec<&str> = summary.jobs.iter().map(|j| j.name.as_str()).collect();
    jobs.sort();
    assert_eq!(jobs, vec!["general-pdf", "general-txt", "label-invoice"]);
    assert!(summary.jobs.iter().all(|j| j.succeeded()));
    assert!(env
        .path(&format!("processing/{}/invoice/input/a.pdf", RUN_1))
        .exists());
    assert!(env.path(&format!("processing/{}/pdf/b.pdf", RUN_1)).exists());
    assert_eq!(summary.registered, 3);

    let table = ResultsTable::new(env.pool.clone(), &table_name_for_run(RUN_1)).unwrap();
    let labelled: Vec<_> = table
        .records()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.json_metadata["metadata"]["label"] == "invoice")
        .collect();
    assert_eq!(labelled.len(), 1);
    assert!(labelled[0].content.uri.ends_with("invoice/input/a.pdf"));
}

#[tokio::test]
async fn routed_files_keep_their_folder_below_the_type_area() {
    let env = Env::new(CLASSIFIER).await;
    env.input("2026/march/a.pdf", b"%PDF-1.4 nested invoice");
    env.input("b.pdf", b"%PDF-1.4 letter");

    let summary = env
        .orchestrator()
        .with_classifier(Some(Arc::new(FragmentWriter)))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();

    assert!(env
        .path(&format!("processing/{}/invoice/input/2026/march/a.pdf", RUN_1))
        .exists());
    assert!(summary.file_failures.is_empty());
    assert_eq!(summary.registered, 2);
}

#[tokio::test]
async fn same_named_files_in_different_folders_are_not_routed() {
    let env = Env::new(CLASSIFIER).await;
    env.input("x/a.pdf", b"%PDF-1.4 first invoice");
    env.input("y/a.pdf", b"%PDF-1.4 second invoice");

    let summary = env
        .orchestrator()
        .with_classifier(Some(Arc::new(FragmentWriter)))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();

    match &summary.classification {
        ClassificationOutcome::Completed { routed, labels } => {
            assert_eq!(*routed, 0);
            assert!(labels.is_empty());
        }
        other => panic!("unexpected classification outcome {:?}", other),
    }
    let routing: Vec<_> = summary
        .file_failures
        .iter()
        .filter(|f| f.stage == Stage::Routing)
        .collect();
    assert_eq!(routing.len(), 2);
    assert!(routing.iter().all(|f| f.error.contains("ambiguous")));

    // Both stay in general processing and both get registered.
    let mut staged = files_under(&env.path(&format!("processing/{}/pdf", RUN_1)));
    staged.sort();
    assert_eq!(staged, vec!["x/a.pdf".to_string(), "y/a.pdf".to_string()]);
    assert_eq!(summary.jobs.len(), 1);
    assert_eq!(summary.jobs[0].name, "general-pdf");
    assert_eq!(summary.registered, 2);
    assert_eq!(env.registry().count().await.unwrap(), 2);
}

#[tokio::test]
async fn classification_failure_falls_back_to_general_processing() {
    let env = Env::new(CLASSIFIER).await;
    env.input("a.pdf", b"%PDF-1.4 invoice");

    let summary = env
        .orchestrator()
        .with_classifier(Some(Arc::new(Unavailable)))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();
    assert!(matches!(summary.classification, ClassificationOutcome::Failed { .. }));
    assert_eq!(summary.jobs.len(), 1);
    assert_eq!(summary.jobs[0].name, "general-pdf");
    assert_eq!(summary.registered, 1);
}

/// Fails one named job and delegates the rest to the built-in runner.
struct FailingJob {
    fail: &'static str,
    inner: LocalJobRunner,
}

#[async_trait]
impl JobRunner for FailingJob {
    async fn run(&self, spec: &JobSpec, table: &ResultsTable) -> Result<JobReport> {
        if spec.name == self.fail {
            return Err(anyhow!("extractor crashed"));
        }
        self.inner.run(spec, table).await
    }
}

#[tokio::test]
async fn failed_job_does_not_block_siblings_or_get_registered() {
    let env = Env::new("").await;
    env.input("a.pdf", b"%PDF-1.4 alpha");
    env.input("n.txt", b"notes");

    let runner = FailingJob {
        fail: "general-txt",
        inner: LocalJobRunner::new(ProcessorRegistry::builtin(), &env.config.pipeline),
    };
    let summary = env
        .orchestrator()
        .with_jobs(Arc::new(runner))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();

    let txt = summary.jobs.iter().find(|j| j.name == "general-txt").unwrap();
    assert!(txt.error.as_deref().unwrap().contains("extractor crashed"));
    let pdf = summary.jobs.iter().find(|j| j.name == "general-pdf").unwrap();
    assert!(pdf.succeeded());
    assert_eq!(summary.registered, 1);

    // The unprocessed file stays in the workspace and is offered again next run.
    assert!(env.path(&format!("processing/{}/txt/n.txt", RUN_1)).exists());
    env.input("n.txt", b"notes");
    let second = env.orchestrator().run_with_id(RUN_2, None).await.unwrap();
    assert_eq!(second.duplicates.len(), 0);
    assert_eq!(second.registered, 1);
}

struct Sleepy;

#[async_trait]
impl JobRunner for Sleepy {
    async fn run(&self, _spec: &JobSpec, _table: &ResultsTable) -> Result<JobReport> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(JobReport::default())
    }
}

#[tokio::test]
async fn job_timeout_fails_only_that_job() {
    let env = Env::new("[pipeline]\njob_timeout_secs = 1").await;
    env.input("a.txt", b"slow");

    let summary = env
        .orchestrator()
        .with_jobs(Arc::new(Sleepy))
        .run_with_id(RUN_1, None)
        .await
        .unwrap();
    assert!(summary.jobs[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(summary.registered, 0);
}

struct BrokenIndex;

#[async_trait]
impl SearchIndexImporter for BrokenIndex {
    async fn import(&self, _table: &ResultsTable) -> Result<u64> {
        Err(anyhow!("index offline"))
    }
}

#[tokio::test]
async fn failed_search_import_skips_registration() {
    let env = Env::new("").await;
    env.input("a.pdf", b"%PDF-1.4 alpha");

    let err = env
        .orchestrator()
        .with_importer(Arc::new(BrokenIndex))
        .run_with_id(RUN_1, None)
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::SearchImport);
    assert_eq!(err.run_id, RUN_1);
    assert_eq!(env.registry().count().await.unwrap(), 0);
}

#[tokio::test]
async fn oversize_text_is_rejected_by_the_job() {
    let env = Env::new("").await;
    env.input("big.txt", &vec![b'x'; 2_700_000]);

    let summary = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    let report = summary.jobs[0].report.as_ref().unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(summary.registered, 0);
    let sidecar = std::fs::read_to_string(env.path(&format!("rejected/{}/txt/big.txt.json", RUN_1))).unwrap();
    assert!(sidecar.contains("exceeding"));
}

#[tokio::test]
async fn same_content_twice_in_one_batch_is_registered_once() {
    let env = Env::new("").await;
    env.input("a.pdf", b"%PDF-1.4 same bytes");
    env.input("copy/a2.pdf", b"%PDF-1.4 same bytes");
    let hash = env.hash_of(b"%PDF-1.4 same bytes").await;

    let summary = env.orchestrator().run_with_id(RUN_1, None).await.unwrap();
    assert_eq!(summary.staged, 1);
    assert_eq!(summary.duplicates.len(), 1);
    assert_eq!(summary.registered, 1);

    let entries = env.registry().list(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content_hash, hash);

    // The later copy is quarantined with a sidecar naming the staged one.
    let rejected = env.path(&format!("rejected/{}/duplicates", RUN_1));
    let sidecars: Vec<String> = files_under(&rejected)
        .into_iter()
        .filter(|f| f.ends_with(".json"))
        .collect();
    assert_eq!(sidecars.len(), 1);
    let sidecar: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(rejected.join(&sidecars[0])).unwrap()).unwrap();
    assert_eq!(sidecar["existing_doc"]["uri"], entries[0].uri.as_str());
    assert_eq!(sidecar["existing_doc"]["id"], "");
    let report = std::fs::read_to_string(env.path(&format!("processing/{}/duplicates/result.jsonl", RUN_1))).unwrap();
    assert_eq!(report.lines().count(), 1);
    assert!(files_under(&env.path("in")).is_empty());
}

#[tokio::test]
async fn full_run_over_an_object_store() {
    let tmp = TempDir::new().unwrap();
    let toml = format!(
        r#"[db]
path = "{}/intake.sqlite"

[storage]
input_prefix = "s3://intake/in"
process_prefix = "s3://intake/processing"
reject_prefix = "s3://intake/rejected"
"#,
        tmp.path().display()
    );
    let config = Arc::new(parse_config(&toml).unwrap());
    let pool = db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    let store = Arc::new(MemoryStore::new().with_page_size(2));
    let storage = Storage::with_object_store(store.clone(), Some("s3://scratch/tmp")).unwrap();

    for (key, body) in [
        ("in/a.pdf", "%PDF-1.4 alpha"),
        ("in/sub/b.pdf", "%PDF-1.4 beta"),
        ("in/sub/n.txt", "notes"),
        ("in/c.xyz", "???"),
    ] {
        storage
            .path(&format!("s3://intake/{}", key))
            .unwrap()
            .write_text(body)
            .await
            .unwrap();
    }
    let hash_b = storage
        .path("s3://intake/in/sub/b.pdf")
        .unwrap()
        .content_hash()
        .await
        .unwrap();
    SqliteRegistry::new(pool.clone())
        .register(&[RegistryEntry {
            id: "id-existing".to_string(),
            file_name: "b.pdf".to_string(),
            uri: "s3://archive/b.pdf".to_string(),
            content_hash: hash_b,
        }])
        .await
        .unwrap();

    let summary = Orchestrator::new(config.clone(), storage.clone(), pool.clone())
        .run_with_id(RUN_1, None)
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.listed, 4);
    assert_eq!(summary.unsupported.len(), 1);
    assert_eq!(summary.duplicates.len(), 1);
    assert_eq!(summary.staged, 2);
    assert_eq!(summary.registered, 2);
    assert!(summary.jobs.iter().all(|j| j.succeeded()));

    let run = format!("{}/", RUN_1);
    let keys = store.keys("intake");
    let expected = [
        format!("processing/{}pdf/a.pdf", run),
        format!("processing/{}txt/sub/n.txt", run),
        format!("processing/{}duplicates/result.jsonl", run),
        format!("rejected/{}duplicates/sub/b.pdf", run),
        format!("rejected/{}duplicates/sub/b.pdf.json", run),
        format!("rejected/{}unsupported/c.xyz", run),
        format!("rejected/{}unsupported/c.xyz.json", run),
    ];
    for key in &expected {
        assert!(keys.contains(key), "missing {} in {:?}", key, keys);
    }
    assert!(!keys.iter().any(|k| k.starts_with("in/")));
    // Checksums from the store were enough; nothing was downloaded to hash.
    assert_eq!(store.downloads(), 0);

    let registered = SqliteRegistry::new(pool.clone()).list(10).await.unwrap();
    let mut uris: Vec<String> = registered.into_iter().map(|e| e.uri).collect();
    uris.sort();
    assert_eq!(
        uris,
        vec![
            format!("s3://intake/processing/{}pdf/a.pdf", run),
            format!("s3://intake/processing/{}txt/sub/n.txt", run),
        ]
    );
}
