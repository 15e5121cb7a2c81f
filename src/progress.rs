//! Run progress reporting.
//!
//! Reports what a run is doing stage by stage so operators see how many
//! files were listed, rejected, staged and processed. Progress goes to
//! **stderr** so stdout stays parseable for scripts (the final run summary
//! is the only thing printed there).

use std::io::Write;

use serde::Serialize;

/// A single progress event of a run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunProgressEvent {
    /// Input listing finished.
    Listing { run_id: String, listed: u64 },
    /// Inputs split into supported and unsupported.
    Partitioned {
        run_id: String,
        supported: u64,
        unsupported: u64,
    },
    /// Duplicate check finished.
    Deduplicated {
        run_id: String,
        duplicates: u64,
        survivors: u64,
    },
    Staged { run_id: String, staged: u64 },
    Classified {
        run_id: String,
        routed: u64,
        labels: Vec<String>,
    },
    /// One processing job finished (successfully or not).
    JobFinished {
        run_id: String,
        job: String,
        rows: u64,
        ok: bool,
        done: u64,
        total: u64,
    },
    Registered { run_id: String, registered: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run docs-processing-…  staged  1,234 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Listing { run_id, listed } => {
                format!("run {}  listed  {} files\n", run_id, format_number(*listed))
            }
            RunProgressEvent::Partitioned {
                run_id,
                supported,
                unsupported,
            } => format!(
                "run {}  partitioned  {} supported, {} unsupported\n",
                run_id,
                format_number(*supported),
                format_number(*unsupported)
            ),
            RunProgressEvent::Deduplicated {
                run_id,
                duplicates,
                survivors,
            } => format!(
                "run {}  deduplicated  {} duplicates, {} new\n",
                run_id,
                format_number(*duplicates),
                format_number(*survivors)
            ),
            RunProgressEvent::Staged { run_id, staged } => {
                format!("run {}  staged  {} files\n", run_id, format_number(*staged))
            }
            RunProgressEvent::Classified {
                run_id,
                routed,
                labels,
            } => format!(
                "run {}  classified  {} routed [{}]\n",
                run_id,
                format_number(*routed),
                labels.join(", ")
            ),
            RunProgressEvent::JobFinished {
                run_id,
                job,
                rows,
                ok,
                done,
                total,
            } => format!(
                "run {}  job {} {}  {} rows  ({} / {})\n",
                run_id,
                job,
                if *ok { "ok" } else { "FAILED" },
                format_number(*rows),
                done,
                total
            ),
            RunProgressEvent::Registered { run_id, registered } => format!(
                "run {}  registered  {} documents\n",
                run_id,
                format_number(*registered)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let mut obj = match serde_json::to_value(&event) {
            Ok(v) => v,
            Err(_) => return,
        };
        if let Some(map) = obj.as_object_mut() {
            map.insert("event".to_string(), serde_json::json!("progress"));
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
