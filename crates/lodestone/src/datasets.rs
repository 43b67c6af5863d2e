//! `lode datasets`: list projects and datasets, toggle dataset activation.

use anyhow::{anyhow, Result};

use lodestone_core::models::Dataset;
use lodestone_core::scope::Catalog;
use lodestone_core::store::Store;

use crate::config::Config;
use crate::db;

/// One row of the listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub project: String,
    pub dataset: Dataset,
    pub chunks: usize,
}

/// Every dataset of every project, ordered by project then dataset name.
pub async fn list_datasets(catalog: &dyn Catalog, store: &dyn Store) -> Result<Vec<DatasetRow>> {
    let mut rows = Vec::new();
    for project in catalog.list_projects().await? {
        for dataset in catalog.datasets_for_project(&project.id).await? {
            let chunks = store.count(&dataset.collection, Some(&dataset.id)).await?;
            rows.push(DatasetRow {
                project: project.name.clone(),
                dataset,
                chunks,
            });
        }
    }
    Ok(rows)
}

pub async fn run_datasets(config: &Config) -> Result<()> {
    let backends = db::open(config).await?;
    let rows = list_datasets(backends.catalog.as_ref(), backends.store.as_ref()).await?;
    backends.pool.close().await;

    if rows.is_empty() {
        println!("No datasets. Run `lode ingest` to create one.");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:<8} {:<7} {:>8}  COLLECTION",
        "PROJECT", "DATASET", "SCOPE", "ACTIVE", "CHUNKS"
    );
    for row in rows {
        println!(
            "{:<20} {:<20} {:<8} {:<7} {:>8}  {}",
            row.project,
            row.dataset.name,
            row.dataset.scope.as_str(),
            if row.dataset.active { "yes" } else { "no" },
            crate::progress::format_number(row.chunks as u64),
            row.dataset.collection
        );
    }
    Ok(())
}

pub async fn run_set_active(config: &Config, project: &str, dataset: &str, active: bool) -> Result<()> {
    let backends = db::open(config).await?;
    let catalog = backends.catalog.as_ref();

    let owner = catalog
        .find_project(project)
        .await?
        .ok_or_else(|| anyhow!("Unknown project: '{}'", project))?;
    let found = catalog
        .find_dataset(&owner.id, dataset)
        .await?
        .ok_or_else(|| anyhow!("Unknown dataset '{}' in project '{}'", dataset, project))?;
    catalog.set_active(&found.id, active).await?;
    backends.pool.close().await;

    println!(
        "{}/{} {}",
        project,
        dataset,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}
