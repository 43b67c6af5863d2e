//! SQLite-backed [`Catalog`] of projects and datasets.
//!
//! Get-or-create is `INSERT .. ON CONFLICT DO NOTHING` followed by a read,
//! so concurrent jobs naming the same project or dataset converge on one
//! row.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::{Dataset, Project, Scope};
use lodestone_core::scope::{ensure_scope, new_dataset, new_project, Catalog};

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> LodestoneError {
    LodestoneError::storage(e)
}

fn row_to_project(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn row_to_dataset(row: &SqliteRow) -> Result<Dataset> {
    let scope: String = row.try_get("scope").map_err(db_err)?;
    Ok(Dataset {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        scope: scope.parse::<Scope>()?,
        active: row.try_get::<i64, _>("active").map_err(db_err)? != 0,
        collection: row.try_get("collection").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn get_or_create_project(&self, name: &str) -> Result<Project> {
        let candidate = new_project(name);
        sqlx::query(
            "INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
        )
        .bind(&candidate.id)
        .bind(&candidate.name)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_project(&candidate.name)
            .await?
            .ok_or_else(|| LodestoneError::storage(format!("project '{}' vanished", name)))
    }

    async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, created_at FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_project).transpose()
    }

    async fn get_or_create_dataset(
        &self,
        project: &Project,
        name: &str,
        scope: Scope,
    ) -> Result<Dataset> {
        let candidate = new_dataset(project, name, scope);
        sqlx::query(
            r#"
            INSERT INTO datasets (id, project_id, name, scope, active, collection, created_at)
            VALUES (?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(project_id, name) DO NOTHING
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.project_id)
        .bind(&candidate.name)
        .bind(candidate.scope.as_str())
        .bind(&candidate.collection)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let dataset = self
            .find_dataset(&project.id, &candidate.name)
            .await?
            .ok_or_else(|| LodestoneError::storage(format!("dataset '{}' vanished", name)))?;
        ensure_scope(&dataset, scope)?;
        Ok(dataset)
    }

    async fn find_dataset(&self, project_id: &str, name: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT * FROM datasets WHERE project_id = ? AND name = ?")
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_dataset).transpose()
    }

    async fn datasets_for_project(&self, project_id: &str) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets WHERE project_id = ? ORDER BY name")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_dataset).collect()
    }

    async fn global_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets WHERE scope = ? ORDER BY name")
            .bind(Scope::Global.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_dataset).collect()
    }

    async fn set_active(&self, dataset_id: &str, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE datasets SET active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(dataset_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LodestoneError::ScopeResolution(format!(
                "unknown dataset id '{}'",
                dataset_id
            )));
        }
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_project).collect()
    }
}
