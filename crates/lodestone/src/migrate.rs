use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            scope TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            collection TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(project_id, name),
            FOREIGN KEY (project_id) REFERENCES projects(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            collection TEXT NOT NULL,
            dataset_id TEXT NOT NULL,
            id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            source_key TEXT NOT NULL,
            position_kind TEXT NOT NULL,
            position_start INTEGER NOT NULL,
            position_end INTEGER NOT NULL,
            position_part INTEGER NOT NULL DEFAULT 0,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            summary TEXT,
            is_code INTEGER NOT NULL,
            language TEXT,
            code_confidence REAL NOT NULL,
            dense BLOB NOT NULL,
            sparse_json TEXT,
            embedding_model TEXT NOT NULL,
            provenance_json TEXT NOT NULL DEFAULT '{}',
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (collection, dataset_id, id),
            UNIQUE (collection, dataset_id, source_key, position_kind, position_start, position_part)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(collection, dataset_id, source_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_datasets_scope ON datasets(scope)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}
