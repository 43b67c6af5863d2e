//! In-memory [`Catalog`] for tests and embedding into other applications.
//!
//! A single `RwLock` guards projects and datasets together, so
//! get-or-create is one critical section.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{LodestoneError, Result};
use crate::models::{Dataset, Project, Scope};

use super::{ensure_scope, new_dataset, new_project, Catalog};

#[derive(Default)]
struct Inner {
    /// Keyed by project name.
    projects: BTreeMap<String, Project>,
    /// Keyed by `(project_id, dataset name)`.
    datasets: BTreeMap<(String, String), Dataset>,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    inner: RwLock<Inner>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> LodestoneError {
    LodestoneError::storage("catalog lock poisoned")
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn get_or_create_project(&self, name: &str) -> Result<Project> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let project = inner
            .projects
            .entry(name.to_string())
            .or_insert_with(|| new_project(name));
        Ok(project.clone())
    }

    async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.projects.get(name).cloned())
    }

    async fn get_or_create_dataset(
        &self,
        project: &Project,
        name: &str,
        scope: Scope,
    ) -> Result<Dataset> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let key = (project.id.clone(), name.to_string());
        if let Some(existing) = inner.datasets.get(&key) {
            ensure_scope(existing, scope)?;
            return Ok(existing.clone());
        }
        let dataset = new_dataset(project, name, scope);
        inner.datasets.insert(key, dataset.clone());
        Ok(dataset)
    }

    async fn find_dataset(&self, project_id: &str, name: &str) -> Result<Option<Dataset>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .datasets
            .get(&(project_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn datasets_for_project(&self, project_id: &str) -> Result<Vec<Dataset>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .datasets
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn global_datasets(&self) -> Result<Vec<Dataset>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .datasets
            .values()
            .filter(|d| d.scope == Scope::Global)
            .cloned()
            .collect())
    }

    async fn set_active(&self, dataset_id: &str, active: bool) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let dataset = inner
            .datasets
            .values_mut()
            .find(|d| d.id == dataset_id)
            .ok_or_else(|| {
                LodestoneError::ScopeResolution(format!("unknown dataset id '{}'", dataset_id))
            })?;
        dataset.active = active;
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.projects.values().cloned().collect())
    }
}
