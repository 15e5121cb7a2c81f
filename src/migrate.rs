use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the registry and search-index tables (idempotent).
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Registry: append-only. content_hash is indexed but not unique; two
    // concurrent runs may both register the same content.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_registry (
            id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            uri TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            registered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local search index, upserted by document id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_documents (
            id TEXT PRIMARY KEY,
            json_data TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            uri TEXT NOT NULL,
            source_table TEXT NOT NULL,
            imported_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_registry_hash ON document_registry(content_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_document_registry_uri ON document_registry(uri)")
        .execute(pool)
        .await?;

    Ok(())
}
