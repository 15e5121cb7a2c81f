//! Search-index import of a run's processed documents.
//!
//! Import is incremental: documents are keyed by id and an id that already
//! exists in the index is overwritten.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::operation::OperationClient;
use crate::results::ResultsTable;

#[async_trait]
pub trait SearchIndexImporter: Send + Sync {
    /// Import every row of `table`. Returns the number of documents imported.
    async fn import(&self, table: &ResultsTable) -> Result<u64>;
}

/// Upserts into the local `search_documents` table with one statement.
pub struct SqliteIndexImporter {
    pool: SqlitePool,
}

impl SqliteIndexImporter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchIndexImporter for SqliteIndexImporter {
    async fn import(&self, table: &ResultsTable) -> Result<u64> {
        // `WHERE true` disambiguates the upsert clause from a join constraint.
        let sql = format!(
            "INSERT INTO search_documents (id, json_data, mime_type, uri, source_table, imported_at)
             SELECT id, json_data, mime_type, uri, ?, ? FROM {} WHERE true
             ON CONFLICT(id) DO UPDATE SET
                json_data = excluded.json_data,
                mime_type = excluded.mime_type,
                uri = excluded.uri,
                source_table = excluded.source_table,
                imported_at = excluded.imported_at",
            table.name()
        );
        let result = sqlx::query(&sql)
            .bind(table.name())
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .with_context(|| format!("search import from {} failed", table.name()))?;
        info!(table = table.name(), documents = result.rows_affected(), "search index updated");
        Ok(result.rows_affected())
    }
}

/// Sends the table's rows to an external index service and waits for the
/// import operation.
pub struct HttpIndexImporter {
    ops: OperationClient,
    timeout: Duration,
}

impl HttpIndexImporter {
    pub fn new(ops: OperationClient, timeout: Duration) -> Self {
        Self { ops, timeout }
    }
}

#[async_trait]
impl SearchIndexImporter for HttpIndexImporter {
    async fn import(&self, table: &ResultsTable) -> Result<u64> {
        let records = table.records().await?;
        let count = records.len() as u64;
        let body = json!({
            "source": table.name(),
            "reconciliationMode": "INCREMENTAL",
            "documents": records,
        });
        self.ops
            .run("/v1/documents:import", &body, self.timeout)
            .await
            .with_context(|| format!("search import of {} failed", table.name()))?;
        info!(table = table.name(), documents = count, "search import finished");
        Ok(count)
    }
}

/// Importer for `provider = "disabled"`.
pub struct NoSearchIndex;

#[async_trait]
impl SearchIndexImporter for NoSearchIndex {
    async fn import(&self, _table: &ResultsTable) -> Result<u64> {
        Ok(0)
    }
}

/// Build the importer selected by `[search_index]`.
pub fn importer_from_config(config: &Config, pool: SqlitePool) -> Arc<dyn SearchIndexImporter> {
    let settings = &config.search_index;
    match (settings.provider.as_str(), settings.endpoint.as_deref()) {
        ("http", Some(endpoint)) => Arc::new(HttpIndexImporter::new(
            OperationClient::new(
                endpoint,
                Duration::from_millis(config.jobs.poll_interval_ms),
            ),
            Duration::from_secs(settings.timeout_secs),
        )),
        ("disabled", _) => Arc::new(NoSearchIndex),
        _ => Arc::new(SqliteIndexImporter::new(pool)),
    }
}
