//! Processor registry and breadth-first expansion of one root file.
//!
//! A [`Processor`] turns a source object into one of three outcomes:
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | [`ProcessOutcome::Index`] | the source is indexed as is |
//! | [`ProcessOutcome::Rendition`] | a derived text object is indexed instead |
//! | [`ProcessOutcome::Expand`] | children were written under the destination |
//!
//! Archives can contain archives, so [`expand_root`] walks derived objects
//! with a queue, a visited set and a depth bound instead of recursion.
//! Every object it meets ends up in the root's object map; indexed objects
//! become [`ProcessedDocumentRecord`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::{DocumentContent, ProcessedDocumentRecord, RejectSidecar};
use crate::render::render_text;
use crate::storage::StoragePath;
use crate::workspace::sidecar_for;

/// Names accepted in `supported_files` without an external job service.
pub const BUILTIN_PROCESSORS: &[&str] = &["index", "text-render", "unzip"];

const MAX_INDEX_BYTES: u64 = 100 * 1024 * 1024;
const MAX_TEXT_INDEX_BYTES: u64 = 2_621_440;
const MAX_ARCHIVE_ENTRY_BYTES: u64 = 100 * 1024 * 1024;
const MAX_ARCHIVE_ENTRIES: usize = 10_000;

pub const STATUS_INDEXED: &str = "Indexed";
pub const STATUS_PROCESSED: &str = "Processed";
pub const STATUS_EXPANDED: &str = "Expanded";
pub const STATUS_UNSUPPORTED: &str = "Not indexed or expanded";
pub const STATUS_DEPTH_LIMIT: &str = "Not expanded: depth limit";
pub const STATUS_ALREADY_SEEN: &str = "Skipped: already processed";

pub enum ProcessOutcome {
    Index,
    Rendition { path: StoragePath, metadata: Value },
    Expand { metadata: Value },
    /// The source must not be indexed (e.g. oversize). It is moved to the
    /// reject area with this reason.
    Reject(String),
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Process `source`, writing any derived objects below `destination`.
    async fn process(&self, source: &StoragePath, destination: &StoragePath) -> Result<ProcessOutcome>;
}

/// Index the source as is, within the search index's size limits.
pub struct IndexProcessor;

#[async_trait]
impl Processor for IndexProcessor {
    fn name(&self) -> &str {
        "index"
    }

    async fn process(&self, source: &StoragePath, _destination: &StoragePath) -> Result<ProcessOutcome> {
        let size = source.size().await?;
        if size > MAX_INDEX_BYTES {
            return Ok(ProcessOutcome::Reject(format!(
                "File size: {} exceeding the {} byte limit for {} files.",
                size,
                MAX_INDEX_BYTES,
                source.suffix()
            )));
        }
        if source.extension().as_deref() == Some("txt") && size > MAX_TEXT_INDEX_BYTES {
            return Ok(ProcessOutcome::Reject(format!(
                "File size: {} exceeding the {} byte limit for .txt files.",
                size, MAX_TEXT_INDEX_BYTES
            )));
        }
        Ok(ProcessOutcome::Index)
    }
}

/// Render the source to plain text and index `<stem>.txt`.
pub struct TextRenderProcessor;

#[async_trait]
impl Processor for TextRenderProcessor {
    fn name(&self) -> &str {
        "text-render"
    }

    async fn process(&self, source: &StoragePath, destination: &StoragePath) -> Result<ProcessOutcome> {
        let extension = source.extension().unwrap_or_default();
        let renderer = extension.clone();
        let text = source
            .read_as_file(|path| async move {
                tokio::task::spawn_blocking(move || -> Result<String> {
                    let bytes = std::fs::read(&path)?;
                    Ok(render_text(&bytes, &renderer)?)
                })
                .await?
            })
            .await?;

        let rendition = destination.join(&format!("{}.txt", source.stem()));
        rendition.write_text(&text).await?;
        Ok(ProcessOutcome::Rendition {
            path: rendition,
            metadata: json!({"renderer": extension, "characters": text.chars().count()}),
        })
    }
}

/// Extract archive entries below the destination.
pub struct UnzipProcessor;

#[async_trait]
impl Processor for UnzipProcessor {
    fn name(&self) -> &str {
        "unzip"
    }

    async fn process(&self, source: &StoragePath, destination: &StoragePath) -> Result<ProcessOutcome> {
        let entries = source
            .read_as_file(|path| async move {
                tokio::task::spawn_blocking(move || read_archive(&path)).await?
            })
            .await?;

        let count = entries.len();
        for (name, bytes) in entries {
            destination.join(&name).write_bytes(bytes).await?;
        }
        Ok(ProcessOutcome::Expand {
            metadata: json!({"entries": count}),
        })
    }
}

/// Entries of a ZIP file, with names confined to the archive root.
fn read_archive(path: &std::path::Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).context("not a readable zip archive")?;
    if archive.len() > MAX_ARCHIVE_ENTRIES {
        bail!("archive has {} entries (limit {})", archive.len(), MAX_ARCHIVE_ENTRIES);
    }
    let mut out = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry outside the archive root");
            continue;
        };
        let name = name.to_string_lossy().replace('\\', "/");
        let mut bytes = Vec::new();
        entry
            .take(MAX_ARCHIVE_ENTRY_BYTES + 1)
            .read_to_end(&mut bytes)?;
        if bytes.len() as u64 > MAX_ARCHIVE_ENTRY_BYTES {
            bail!("archive entry {} exceeds {} bytes", name, MAX_ARCHIVE_ENTRY_BYTES);
        }
        out.push((name, bytes));
    }
    Ok(out)
}

/// Processors by name.
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(IndexProcessor));
        registry.register(Arc::new(TextRenderProcessor));
        registry.register(Arc::new(UnzipProcessor));
        registry
    }

    /// Add or replace a processor under its own name.
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        self.processors
            .insert(processor.name().to_string(), processor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }
}

/// Document id: stable for a given location and content.
pub fn document_id(uri: &str, content_hash: &str) -> String {
    let digest = Sha256::digest(format!("{}\n{}", uri, content_hash).as_bytes());
    format!("id-{}", &hex::encode(digest)[..32])
}

/// Moves `file` to `relative` below `reject_dir` and writes
/// `{"error_msg": reason}` next to it.
pub async fn reject_file(
    file: &StoragePath,
    reject_dir: &StoragePath,
    relative: &str,
    reason: &str,
) -> Result<StoragePath> {
    let dest = reject_dir.join(relative);
    file.move_to(&dest)
        .await
        .with_context(|| format!("failed to move {} to {}", file, dest))?;
    let sidecar = RejectSidecar {
        error_msg: reason.to_string(),
    };
    sidecar_for(&dest)
        .write_text(&serde_json::to_string(&sidecar)?)
        .await?;
    Ok(dest)
}

/// One object met while expanding a root.
#[derive(Debug, Clone)]
struct WorkItem {
    path: StoragePath,
    depth: usize,
    objid: String,
    status: String,
    metadata: Value,
    mime_type: String,
}

impl WorkItem {
    fn new(path: StoragePath, depth: usize) -> Self {
        let mime_type = path.mime_type();
        Self {
            path,
            depth,
            objid: String::new(),
            status: "Unprocessed".to_string(),
            metadata: json!({}),
            mime_type,
        }
    }

    fn summary(&self) -> Value {
        json!({
            "uri": self.path.address(),
            "objid": self.objid,
            "status": self.status,
            "mimetype": self.mime_type,
        })
    }
}

/// Knobs for [`expand_root`].
pub struct Expansion<'a> {
    pub registry: &'a ProcessorRegistry,
    /// Processor for objects derived from the root, by lowercase extension.
    pub processor_for: &'a (dyn Fn(&str) -> Option<String> + Send + Sync),
    pub max_depth: usize,
    /// Prefix the roots were listed from; rejects and outputs keep the
    /// root's path below it.
    pub input_root: &'a StoragePath,
    pub reject_dir: &'a StoragePath,
    /// Extra metadata merged into every record (e.g. the routed label).
    pub extra_metadata: Value,
}

/// Result of processing one root file.
#[derive(Debug)]
pub enum RootResult {
    Records(Vec<ProcessedDocumentRecord>),
    /// The root could not be processed and was moved to the reject area.
    Rejected { reason: String },
}

/// Process `root` with `root_processor` and everything it expands into.
///
/// `output_dir` receives the root's derived objects under `<relative>.out/`,
/// where `<relative>` is the root's path below the input root; derived
/// objects in turn get `<object>.out/` next to themselves.
pub async fn expand_root(
    root: &StoragePath,
    root_processor: &str,
    output_dir: &StoragePath,
    expansion: &Expansion<'_>,
) -> Result<RootResult> {
    let mut queue: VecDeque<(usize, Option<String>)> = VecDeque::new();
    let mut items: Vec<WorkItem> = vec![WorkItem::new(root.clone(), 0)];
    let mut visited: HashSet<String> = HashSet::new();
    queue.push_back((0, Some(root_processor.to_string())));

    while let Some((idx, processor_name)) = queue.pop_front() {
        let path = items[idx].path.clone();
        let depth = items[idx].depth;
        let is_root = idx == 0;

        if !visited.insert(path.address()) {
            items[idx].status = STATUS_ALREADY_SEEN.to_string();
            continue;
        }
        if depth > expansion.max_depth {
            items[idx].status = STATUS_DEPTH_LIMIT.to_string();
            continue;
        }

        let Some(name) = processor_name else {
            items[idx].status = STATUS_UNSUPPORTED.to_string();
            items[idx].metadata = json!({"reason": format!("file of type {} not supported", path.suffix())});
            continue;
        };
        let Some(processor) = expansion.registry.get(&name) else {
            if is_root {
                bail!("processor '{}' is not registered", name);
            }
            items[idx].status = STATUS_UNSUPPORTED.to_string();
            items[idx].metadata = json!({"reason": format!("processor {} is not available", name)});
            continue;
        };

        let relative = if is_root {
            path.relative_to(expansion.input_root)
        } else {
            path.relative_to(output_dir)
        }
        .unwrap_or_else(|| path.name().to_string());

        let destination = if is_root {
            output_dir.join(&format!("{}.out", relative))
        } else {
            path.sibling(&format!("{}.out", path.name()))
        };

        let outcome = match processor.process(&path, &destination).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format!("Doc processor fail with error: {:#}", e);
                warn!(file = %path, processor = %name, error = %reason, "processor failed");
                reject_file(&path, expansion.reject_dir, &relative, &reason).await?;
                if is_root {
                    return Ok(RootResult::Rejected { reason });
                }
                items[idx].status = format!("Processor failed with error {:#}", e);
                continue;
            }
        };

        match outcome {
            ProcessOutcome::Index => {
                let hash = path.content_hash().await?;
                items[idx].objid = document_id(&path.address(), &hash);
                items[idx].status = STATUS_INDEXED.to_string();
            }
            ProcessOutcome::Rendition {
                path: rendition,
                metadata,
            } => {
                let hash = rendition.content_hash().await?;
                items[idx].status = STATUS_PROCESSED.to_string();
                items[idx].metadata = metadata;
                let mut derived = WorkItem::new(rendition.clone(), depth + 1);
                derived.objid = document_id(&rendition.address(), &hash);
                derived.status = STATUS_INDEXED.to_string();
                derived.metadata = json!({"source": path.address()});
                visited.insert(rendition.address());
                items.push(derived);
            }
            ProcessOutcome::Expand { metadata } => {
                items[idx].status = STATUS_EXPANDED.to_string();
                items[idx].metadata = metadata;
                let children = destination.list().collect_all().await?;
                debug!(file = %path, children = children.len(), "expanded");
                for child in children {
                    let child_processor = child
                        .extension()
                        .and_then(|ext| (expansion.processor_for)(&ext));
                    items.push(WorkItem::new(child, depth + 1));
                    queue.push_back((items.len() - 1, child_processor));
                }
            }
            ProcessOutcome::Reject(reason) => {
                reject_file(&path, expansion.reject_dir, &relative, &reason).await?;
                if is_root {
                    return Ok(RootResult::Rejected { reason });
                }
                items[idx].status = format!("Rejected: {}", reason);
            }
        }
    }

    let object_map: Vec<Value> = items.iter().map(WorkItem::summary).collect();
    let records = items
        .iter()
        .filter(|item| !item.objid.is_empty())
        .map(|item| {
            let mut metadata = item.metadata.clone();
            if let (Some(target), Some(extra)) =
                (metadata.as_object_mut(), expansion.extra_metadata.as_object())
            {
                for (k, v) in extra {
                    target.insert(k.clone(), v.clone());
                }
            }
            ProcessedDocumentRecord {
                id: item.objid.clone(),
                json_metadata: json!({
                    "objs": object_map,
                    "metadata": metadata,
                    "status": item.status,
                }),
                content: DocumentContent {
                    mime_type: item.mime_type.clone(),
                    uri: item.path.address(),
                },
            }
        })
        .collect();
    Ok(RootResult::Records(records))
}
