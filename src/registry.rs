//! Document registry: durable content fingerprints of ingested documents.
//!
//! The registry answers one question for the pipeline: "has this content
//! been ingested before?" Identity is the content hash of
//! [`StoragePath::content_hash`], never the file name or location.
//!
//! The table is append-only. Uniqueness of `content_hash` is advisory: it is
//! upheld by checking for duplicates before processing, not by a constraint,
//! so two concurrent runs ingesting the same bytes can both register them.
//! [`DocumentRegistry::lookup`] returns the earliest entry in that case.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::models::{DuplicateMatch, ExistingDocument, RegistryEntry};
use crate::storage::StoragePath;

/// Candidates hashed concurrently by [`hash_candidates`].
const HASH_CONCURRENCY: usize = 8;

/// Storage seam for registry lookups and appends.
#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    /// Entries whose hash is in `hashes`, keyed by hash. One query for the
    /// whole set; an empty set issues no query.
    async fn lookup(&self, hashes: &HashSet<String>) -> Result<HashMap<String, RegistryEntry>>;

    /// Append entries. Returns the number of rows written.
    async fn register(&self, entries: &[RegistryEntry]) -> Result<usize>;
}

/// Registry stored in the `document_registry` SQLite table.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_registry")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Most recently registered entries first.
    pub async fn list(&self, limit: i64) -> Result<Vec<RegistryEntry>> {
        let rows = sqlx::query(
            "SELECT id, file_name, uri, content_hash FROM document_registry
             ORDER BY rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> RegistryEntry {
    RegistryEntry {
        id: row.get("id"),
        file_name: row.get("file_name"),
        uri: row.get("uri"),
        content_hash: row.get("content_hash"),
    }
}

#[async_trait]
impl DocumentRegistry for SqliteRegistry {
    async fn lookup(&self, hashes: &HashSet<String>) -> Result<HashMap<String, RegistryEntry>> {
        let mut found = HashMap::new();
        if hashes.is_empty() {
            return Ok(found);
        }

        // Bind the whole set as one JSON array; the query plan stays the same
        // regardless of batch size.
        let mut sorted: Vec<&String> = hashes.iter().collect();
        sorted.sort();
        let wanted = serde_json::to_string(&sorted)?;
        let rows = sqlx::query(
            "SELECT id, file_name, uri, content_hash FROM document_registry
             WHERE content_hash IN (SELECT value FROM json_each(?))
             ORDER BY rowid",
        )
        .bind(wanted)
        .fetch_all(&self.pool)
        .await
        .context("registry lookup failed")?;

        for row in &rows {
            let entry = entry_from_row(row);
            found.entry(entry.content_hash.clone()).or_insert(entry);
        }
        debug!(candidates = hashes.len(), matches = found.len(), "registry lookup");
        Ok(found)
    }

    async fn register(&self, entries: &[RegistryEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO document_registry (id, file_name, uri, content_hash, registered_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&entry.id)
            .bind(&entry.file_name)
            .bind(&entry.uri)
            .bind(&entry.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.context("registry append failed")?;
        Ok(entries.len())
    }
}

/// Hash every candidate (bounded concurrency), returning per-file results in
/// input order. Hashes are cached on the paths, so later calls are free.
pub async fn hash_candidates(
    candidates: &[StoragePath],
) -> Vec<(StoragePath, Result<String, crate::error::StorageError>)> {
    let permits = Arc::new(Semaphore::new(HASH_CONCURRENCY));
    let mut tasks = JoinSet::new();
    for (idx, path) in candidates.iter().cloned().enumerate() {
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let hash = path.content_hash().await;
            (idx, path, hash)
        });
    }

    let mut results: Vec<Option<(StoragePath, Result<String, _>)>> =
        (0..candidates.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, path, hash)) => results[idx] = Some((path, hash)),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
    results.into_iter().flatten().collect()
}

/// Pair each candidate whose content is already registered with the existing
/// entry. Candidates not returned are new.
///
/// Hashes are computed once per candidate (cached on the path) and looked up
/// with a single registry query.
pub async fn detect_duplicates(
    registry: &dyn DocumentRegistry,
    candidates: &[StoragePath],
) -> Result<Vec<DuplicateMatch>> {
    let mut hashed = Vec::with_capacity(candidates.len());
    for (path, hash) in hash_candidates(candidates).await {
        let hash = hash.with_context(|| format!("failed to hash {}", path))?;
        hashed.push((path, hash));
    }

    let wanted: HashSet<String> = hashed.iter().map(|(_, h)| h.clone()).collect();
    let existing = registry.lookup(&wanted).await?;

    Ok(hashed
        .into_iter()
        .filter_map(|(path, hash)| {
            existing.get(&hash).map(|entry| DuplicateMatch {
                candidate: path.address(),
                existing: ExistingDocument {
                    uri: entry.uri.clone(),
                    id: entry.id.clone(),
                },
                content_hash: hash,
            })
        })
        .collect())
}
