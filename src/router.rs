//! Classifier router: turns raw classifier fragments into per-file labels
//! and moves matched files into their label's input area.
//!
//! # Algorithm
//!
//! 1. Read every fragment under the classifier output (listing order) and
//!    recover the source file from the fragment name: `my-doc-3.json` came
//!    from `my-doc.<file_type>`. Fragments of one source need not be adjacent.
//! 2. Group entities by source, keeping the order in which they were read.
//! 3. Per source, keep entities whose label is known (trimmed,
//!    case-insensitive) and whose confidence is strictly above the threshold.
//! 4. No survivors: the file stays general. Otherwise a stable sort by
//!    confidence descending picks the label; equal confidences resolve to
//!    the entity read first.
//! 5. Move the file to `{workspace}/{label}/input/`, keeping its path below
//!    the type area, and report the set of labels that received files. A
//!    source name shared by several staged files is not routed.
//!
//! The order-dependent tie-break in step 4 is kept as observable behavior.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ClassifierConfig;
use crate::models::ClassificationEntity;
use crate::storage::StoragePath;
use crate::workspace::RunWorkspace;

#[derive(Deserialize)]
#[serde(untagged)]
enum FragmentBody {
    Wrapped {
        #[serde(default)]
        entities: Vec<RawEntity>,
    },
    List(Vec<RawEntity>),
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(rename = "type", default)]
    label: String,
    #[serde(default)]
    confidence: f64,
}

/// One routed file.
#[derive(Debug, Clone)]
pub struct RoutedFile {
    pub from: StoragePath,
    pub to: StoragePath,
    pub label: String,
}

#[derive(Debug, Default)]
pub struct RoutingOutcome {
    pub routed: Vec<RoutedFile>,
    /// Distinct labels that received at least one file.
    pub labels: BTreeSet<String>,
    /// Sources with fragments but no qualifying entity.
    pub unmatched: usize,
    /// Files whose move failed; they stay in the general area.
    pub failures: Vec<(String, String)>,
}

pub struct ClassifierRouter {
    labels: Vec<String>,
    threshold: f64,
    file_type: String,
}

/// Source stem encoded in a fragment name: everything before the last `-`
/// of the basename, without the `.json` extension.
pub fn source_stem(fragment_name: &str) -> &str {
    let base = fragment_name.rsplit('/').next().unwrap_or(fragment_name);
    let base = base.strip_suffix(".json").unwrap_or(base);
    match base.rsplit_once('-') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    }
}

impl ClassifierRouter {
    pub fn new(labels: &[String], threshold: f64, file_type: &str) -> Self {
        Self {
            labels: labels.iter().map(|l| normalize(l)).collect(),
            threshold,
            file_type: file_type.to_ascii_lowercase(),
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self::new(&config.labels, config.confidence_threshold, &config.file_type)
    }

    /// Entities of one fragment file, tagged with the source file name.
    pub fn parse_fragment(&self, fragment_name: &str, body: &str) -> Result<Vec<ClassificationEntity>> {
        let parsed: FragmentBody = serde_json::from_str(body)
            .with_context(|| format!("malformed classifier fragment {}", fragment_name))?;
        let raw = match parsed {
            FragmentBody::Wrapped { entities } => entities,
            FragmentBody::List(entities) => entities,
        };
        let source = format!("{}.{}", source_stem(fragment_name), self.file_type);
        Ok(raw
            .into_iter()
            .map(|e| ClassificationEntity {
                label: e.label,
                confidence: e.confidence,
                source_file_id: source.clone(),
            })
            .collect())
    }

    /// Label for one source's entities, or `None` to leave it general.
    pub fn choose_label(&self, entities: &[ClassificationEntity]) -> Option<String> {
        let mut surviving: Vec<&ClassificationEntity> = entities
            .iter()
            .filter(|e| e.confidence > self.threshold)
            .filter(|e| self.labels.contains(&normalize(&e.label)))
            .collect();
        // `sort_by` is stable: equal confidences keep reassembly order.
        surviving.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        surviving.first().map(|e| normalize(&e.label))
    }

    /// Label decision per source file, in first-seen order.
    pub fn decide(&self, entities: Vec<ClassificationEntity>) -> Vec<(String, Option<String>)> {
        group_by_source(entities)
            .into_iter()
            .map(|(source, group)| {
                let label = self.choose_label(&group);
                (source, label)
            })
            .collect()
    }

    /// Read every fragment under `output`.
    pub async fn read_fragments(&self, output: &StoragePath) -> Result<Vec<ClassificationEntity>> {
        let mut lister = output.list();
        let mut entities = Vec::new();
        while let Some(fragment) = lister.next().await? {
            if fragment.extension().as_deref() != Some("json") {
                continue;
            }
            let body = fragment.read_text().await?;
            entities.extend(self.parse_fragment(fragment.name(), &body)?);
        }
        Ok(entities)
    }

    /// Read fragments under `output` and move matched `staged` files into
    /// their label's input area.
    pub async fn route(
        &self,
        output: &StoragePath,
        staged: &[StoragePath],
        workspace: &RunWorkspace,
    ) -> Result<RoutingOutcome> {
        let entities = self.read_fragments(output).await?;
        let source_root = workspace.type_dir(&self.file_type);

        let mut by_name: HashMap<&str, Vec<&StoragePath>> = HashMap::new();
        for path in staged {
            by_name.entry(path.name()).or_default().push(path);
        }

        let mut outcome = RoutingOutcome::default();
        for (source, label) in self.decide(entities) {
            let Some(label) = label else {
                debug!(%source, "no qualifying label, leaving general");
                outcome.unmatched += 1;
                continue;
            };
            let Some(paths) = by_name.get(source.as_str()) else {
                warn!(%source, "classifier output names a file that was not staged");
                continue;
            };
            // Fragments carry only the basename; same-named files in
            // different folders cannot be told apart.
            if paths.len() > 1 {
                warn!(%source, files = paths.len(), %label, "ambiguous classifier source, leaving general");
                for path in paths {
                    outcome.failures.push((
                        path.address(),
                        format!(
                            "ambiguous classifier source {}: {} staged files share the name",
                            source,
                            paths.len()
                        ),
                    ));
                }
                continue;
            }
            for path in paths {
                let relative = path
                    .relative_to(&source_root)
                    .unwrap_or_else(|| path.name().to_string());
                let dest = workspace.label_input(&label).join(&relative);
                match path.move_to(&dest).await {
                    Ok(()) => {
                        outcome.labels.insert(label.clone());
                        outcome.routed.push(RoutedFile {
                            from: (*path).clone(),
                            to: dest,
                            label: label.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(file = %path, %label, error = %e, "failed to route file");
                        outcome.failures.push((path.address(), e.to_string()));
                    }
                }
            }
        }
        info!(
            routed = outcome.routed.len(),
            labels = outcome.labels.len(),
            unmatched = outcome.unmatched,
            "routing complete"
        );
        Ok(outcome)
    }
}

fn normalize(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Group entities by source file, sources in first-seen order and entities
/// in reading order.
pub fn group_by_source(entities: Vec<ClassificationEntity>) -> Vec<(String, Vec<ClassificationEntity>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<ClassificationEntity>)> = Vec::new();
    for entity in entities {
        match index.get(&entity.source_file_id) {
            Some(&i) => groups[i].1.push(entity),
            None => {
                index.insert(entity.source_file_id.clone(), groups.len());
                groups.push((entity.source_file_id.clone(), vec![entity]));
            }
        }
    }
    groups
}
