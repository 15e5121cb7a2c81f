use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn intake_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("intake");
    path
}

/// Minimal PDF header and trailer; the `index` processor only checks size.
fn minimal_pdf(marker: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    out.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    out.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\n");
    out.extend_from_slice(format!("% {}\n", marker).as_bytes());
    out.extend_from_slice(b"trailer\n<< /Root 1 0 R >>\n%%EOF\n");
    out
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let inbox = root.join("inbox");
    fs::create_dir_all(inbox.join("2026")).unwrap();
    fs::write(inbox.join("report.pdf"), minimal_pdf("report")).unwrap();
    fs::write(inbox.join("2026/notes.txt"), "Quarterly notes.\n").unwrap();
    fs::write(inbox.join("diagram.vsdx"), b"PK\x03\x04").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/intake.sqlite"

[storage]
input_prefix = "{root}/inbox"
process_prefix = "{root}/processing"
reject_prefix = "{root}/rejected"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("intake.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_intake(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = intake_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run intake binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_intake(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));

    let (_, stderr, ok) = run_intake(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_check_prints_effective_config() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_intake(&config, &["check"]);
    assert!(ok, "check failed: {}", stderr);
    assert!(stdout.contains("input_prefix"));
    assert!(stdout.contains("processor = \"unzip\""));
    assert!(stderr.contains("configuration ok"));
}

#[test]
fn test_check_rejects_overlapping_prefixes() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("intake.toml");
    fs::write(
        &config,
        r#"[db]
path = "/tmp/unused.sqlite"

[storage]
input_prefix = "s3://bucket/in"
process_prefix = "s3://bucket/in/processing"
reject_prefix = "s3://bucket/rejected"
"#,
    )
    .unwrap();
    let (_, stderr, ok) = run_intake(&config, &["check"]);
    assert!(!ok);
    assert!(stderr.contains("prefix"), "unexpected error: {}", stderr);
}

#[test]
fn test_run_json_then_rerun_finds_duplicates() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();
    run_intake(&config, &["init"]);

    let (stdout, stderr, ok) = run_intake(&config, &["run", "--json", "--progress", "off"]);
    assert!(ok, "run failed: {}", stderr);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["outcome"], "completed");
    assert_eq!(summary["staged"], 2);
    assert_eq!(summary["registered"], 2);
    assert_eq!(summary["unsupported"].as_array().unwrap().len(), 1);
    let run_id = summary["run_id"].as_str().unwrap().to_string();
    assert!(run_id.starts_with("docs-processing-"));
    assert!(root
        .join(format!("rejected/{}/unsupported/diagram.vsdx.json", run_id))
        .exists());

    let (stdout, _, ok) = run_intake(&config, &["registry", "count"]);
    assert!(ok);
    assert_eq!(stdout.trim(), "2");

    // Same bytes again: every file is a duplicate.
    fs::write(root.join("inbox/report.pdf"), minimal_pdf("report")).unwrap();
    let (stdout, stderr, ok) = run_intake(&config, &["run", "--progress", "off"]);
    assert!(ok, "rerun failed: {}", stderr);
    assert!(stdout.contains("duplicates: 1"));
    assert!(stdout.contains("registered: 0"));

    let (stdout, _, _) = run_intake(&config, &["registry", "count"]);
    assert_eq!(stdout.trim(), "2");
}

#[test]
fn test_hash_matches_registry_lookup() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();
    let copy = root.join("copy.pdf");
    fs::write(&copy, minimal_pdf("report")).unwrap();

    let (stdout, stderr, ok) = run_intake(&config, &["hash", copy.to_str().unwrap()]);
    assert!(ok, "hash failed: {}", stderr);
    let hash = stdout.split_whitespace().next().unwrap().to_string();
    assert_eq!(hash.len(), 64);

    run_intake(&config, &["run", "--progress", "off"]);
    let (stdout, _, ok) = run_intake(&config, &["registry", "lookup", &hash]);
    assert!(ok);
    assert!(stdout.contains("report.pdf"), "lookup output: {}", stdout);
    assert!(stdout.contains("id-"));
}

#[test]
fn test_empty_inbox_run_is_noop() {
    let (tmp, config) = setup_test_env();
    let root = tmp.path();
    fs::remove_dir_all(root.join("inbox")).unwrap();
    fs::create_dir_all(root.join("inbox")).unwrap();

    let (stdout, stderr, ok) = run_intake(&config, &["run", "--json", "--progress", "off"]);
    assert!(ok, "run failed: {}", stderr);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["outcome"], "no_supported_files");
    assert!(summary["workspace"].is_null());
    assert!(!root.join("processing").exists());
}
