//! Run identity and workspace layout.
//!
//! Each invocation gets a unique run id, `docs-processing-{dd-mm-YYYY}-{8 random}`,
//! and every file it stages lives under `{process_prefix}/{run_id}/`:
//!
//! ```text
//! {process}/{run_id}/
//!   pdf/                     staged inputs by type
//!   pdf-output/              general job output
//!   duplicates/result.jsonl  duplicate report
//!   classifier-output/       raw classifier fragments
//!   form/input/  form/output/
//! {reject}/{run_id}/
//!   unsupported/  duplicates/  pdf/
//! ```
//!
//! A run never touches another run's workspace, so a failed run is simply
//! abandoned and a fresh invocation starts clean.

use chrono::Local;

use crate::storage::StoragePath;

pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "docs-processing-{}-{}",
        Local::now().format("%d-%m-%Y"),
        &suffix[..8]
    )
}

/// Paths derived from the run id.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    run_id: String,
    root: StoragePath,
    reject_root: StoragePath,
}

impl RunWorkspace {
    pub fn new(run_id: &str, process_prefix: &StoragePath, reject_prefix: &StoragePath) -> Self {
        Self {
            run_id: run_id.to_string(),
            root: process_prefix.join(run_id),
            reject_root: reject_prefix.join(run_id),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &StoragePath {
        &self.root
    }

    /// Staged inputs of one type.
    pub fn type_dir(&self, file_type: &str) -> StoragePath {
        self.root.join(file_type)
    }

    /// Output area of the general job for one type.
    pub fn type_output(&self, file_type: &str) -> StoragePath {
        self.root.join(&format!("{}-output", file_type))
    }

    pub fn duplicates_report(&self) -> StoragePath {
        self.root.join("duplicates/result.jsonl")
    }

    pub fn classifier_output(&self) -> StoragePath {
        self.root.join("classifier-output")
    }

    pub fn label_input(&self, label: &str) -> StoragePath {
        self.root.join(&format!("{}/input", sanitize_label(label)))
    }

    pub fn label_output(&self, label: &str) -> StoragePath {
        self.root.join(&format!("{}/output", sanitize_label(label)))
    }

    pub fn reject_unsupported(&self) -> StoragePath {
        self.reject_root.join("unsupported")
    }

    pub fn reject_duplicates(&self) -> StoragePath {
        self.reject_root.join("duplicates")
    }

    /// Reject area handed to the job processing `area` (a type or a label).
    pub fn reject_for(&self, area: &str) -> StoragePath {
        self.reject_root.join(&sanitize_label(area))
    }
}

/// Labels come from the classifier; keep them to one safe path segment.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Sidecar path for a rejected file: `<file>.json` next to it.
pub fn sidecar_for(path: &StoragePath) -> StoragePath {
    path.sibling(&format!("{}.json", path.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn run_id_shape() {
        let id = new_run_id();
        assert!(id.starts_with("docs-processing-"));
        let parts: Vec<&str> = id.split('-').collect();
        // docs, processing, dd, mm, yyyy, suffix
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[2].len(), 2);
        assert_eq!(parts[4].len(), 4);
        assert_eq!(parts[5].len(), 8);
        assert!(parts[5].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_run_id(), new_run_id());
    }

    #[test]
    fn layout_under_process_and_reject_prefixes() {
        let storage = Storage::local();
        let ws = RunWorkspace::new(
            "docs-processing-01-01-2026-abcd1234",
            &storage.path("s3://b/process").unwrap(),
            &storage.path("s3://b/reject").unwrap(),
        );
        assert_eq!(
            ws.type_dir("pdf").address(),
            "s3://b/process/docs-processing-01-01-2026-abcd1234/pdf"
        );
        assert_eq!(
            ws.label_input("Purchase Order").address(),
            "s3://b/process/docs-processing-01-01-2026-abcd1234/purchase_order/input"
        );
        assert_eq!(
            ws.reject_duplicates().address(),
            "s3://b/reject/docs-processing-01-01-2026-abcd1234/duplicates"
        );
    }

    #[test]
    fn sidecar_sits_next_to_file() {
        let storage = Storage::local();
        let file = storage.path("s3://b/reject/run/unsupported/c.xyz").unwrap();
        assert_eq!(
            sidecar_for(&file).address(),
            "s3://b/reject/run/unsupported/c.xyz.json"
        );
        let local = storage.path("/tmp/reject/c.xyz").unwrap();
        assert_eq!(sidecar_for(&local).address(), "/tmp/reject/c.xyz.json");
    }
}
