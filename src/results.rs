//! Per-run results table.
//!
//! Every extraction job of a run writes its [`ProcessedDocumentRecord`]s into
//! one SQLite table named after the run id (`-` → `_`). Rows are keyed by
//! document id; writing an id twice replaces the earlier row. The search
//! importer and the registry update both read from this table.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};

use crate::models::{DocumentContent, ProcessedDocumentRecord};

#[derive(Clone)]
pub struct ResultsTable {
    pool: SqlitePool,
    name: String,
}

/// Table name for a run id: `docs-processing-01-02-2026-ab12cd34` →
/// `docs_processing_01_02_2026_ab12cd34`.
pub fn table_name_for_run(run_id: &str) -> String {
    run_id.replace('-', "_")
}

impl ResultsTable {
    /// Bind to `name`. Only `[a-z0-9_]` names are accepted since the name is
    /// interpolated into SQL.
    pub fn new(pool: SqlitePool, name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !name.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            bail!("invalid results table name '{}'", name);
        }
        Ok(Self {
            pool,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                job TEXT NOT NULL,
                json_data TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                uri TEXT NOT NULL
            )",
            self.name
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert `records` on behalf of `job`. Returns the number of rows written.
    pub async fn insert(&self, job: &str, records: &[ProcessedDocumentRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {} (id, job, json_data, mime_type, uri) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                job = excluded.job,
                json_data = excluded.json_data,
                mime_type = excluded.mime_type,
                uri = excluded.uri",
            self.name
        );
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(&sql)
                .bind(&record.id)
                .bind(job)
                .bind(serde_json::to_string(&record.json_metadata)?)
                .bind(&record.content.mime_type)
                .bind(&record.content.uri)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }

    /// All rows in insertion order.
    pub async fn records(&self) -> Result<Vec<ProcessedDocumentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT id, json_data, mime_type, uri FROM {} ORDER BY rowid",
            self.name
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("json_data");
            out.push(ProcessedDocumentRecord {
                id: row.get("id"),
                json_metadata: serde_json::from_str(&json)?,
                content: DocumentContent {
                    mime_type: row.get("mime_type"),
                    uri: row.get("uri"),
                },
            });
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.name))
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
