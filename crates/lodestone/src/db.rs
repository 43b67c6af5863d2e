use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

use lodestone_core::scope::Catalog;
use lodestone_core::store::Store;

use crate::catalog::SqliteCatalog;
use crate::config::Config;
use crate::migrate::migrate;
use crate::sqlite_store::SqliteStore;

/// Open the pool, creating the database file and its directory if missing.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Catalog and store sharing one migrated pool.
pub struct Backends {
    pub pool: SqlitePool,
    pub catalog: Arc<dyn Catalog>,
    pub store: Arc<dyn Store>,
}

/// Connect and migrate.
pub async fn open(config: &Config) -> Result<Backends> {
    let pool = connect(config).await?;
    migrate(&pool).await?;
    Ok(Backends {
        catalog: Arc::new(SqliteCatalog::new(pool.clone())),
        store: Arc::new(SqliteStore::new(pool.clone())),
        pool,
    })
}
