//! Core data models that flow through the intake pipeline.
//!
//! Registry entries, duplicate matches, classifier entities, processed
//! document records and the JSON sidecars written next to rejected files.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One ingested piece of content in the document registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub file_name: String,
    pub uri: String,
    pub content_hash: String,
}

/// A candidate whose content is already registered.
///
/// Serializes as one line of the duplicate report and as the sidecar of the
/// rejected duplicate: `{"doc": uri, "existing_doc": {"uri": .., "id": ..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    #[serde(rename = "doc")]
    pub candidate: String,
    #[serde(rename = "existing_doc")]
    pub existing: ExistingDocument,
    #[serde(skip)]
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingDocument {
    pub uri: String,
    pub id: String,
}

/// One labelled entity emitted by the classifier for a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationEntity {
    pub label: String,
    pub confidence: f64,
    pub source_file_id: String,
}

/// Content reference of a processed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContent {
    pub mime_type: String,
    pub uri: String,
}

/// A row written by an extraction job into its output metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDocumentRecord {
    pub id: String,
    pub json_metadata: Value,
    pub content: DocumentContent,
}

impl ProcessedDocumentRecord {
    /// Every artifact uri the record mentions: the indexed content plus
    /// each `objs[*].uri` in the metadata graph.
    pub fn artifact_uris(&self) -> Vec<&str> {
        let mut uris = vec![self.content.uri.as_str()];
        if let Some(objs) = self.json_metadata.get("objs").and_then(Value::as_array) {
            uris.extend(
                objs.iter()
                    .filter_map(|o| o.get("uri").and_then(Value::as_str)),
            );
        }
        uris
    }
}

/// Sidecar written next to a rejected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectSidecar {
    pub error_msg: String,
}
