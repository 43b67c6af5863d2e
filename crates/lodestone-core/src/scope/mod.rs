//! Project / dataset / scope resolution.
//!
//! Maps a `(project, dataset, scope)` request onto the physical collection
//! it writes to, and computes the set of datasets a query may read.
//!
//! # Collection names
//!
//! | Scope | Collection |
//! |-------|------------|
//! | `global` | `global` |
//! | `project` | `p_<slug>_<hash8>` |
//! | `dataset` | `p_<slug>_<hash8>__d_<slug>_<hash8>` |
//!
//! `slug` is a lowercase, underscore-separated form of the name (at most 32
//! chars); `hash8` is the first 8 hex digits of the SHA-256 of the raw name,
//! so names that slug identically still land in distinct collections.
//!
//! # Access lattice
//!
//! - A dataset-scoped request sees that dataset.
//! - A project-scoped request sees every dataset the project owns.
//! - Every request also sees active `global` datasets unless it opts out.
//! - Inactive datasets are never visible.

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{LodestoneError, Result};
use crate::models::{Dataset, Project, Scope};

pub use memory::InMemoryCatalog;

pub const GLOBAL_COLLECTION: &str = "global";

const SLUG_MAX: usize = 32;

/// Where an ingestion job writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub project_id: String,
    pub dataset_id: String,
    pub scope: Scope,
    pub collection: String,
}

/// A dataset a query may read, with the collection holding its chunks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetRef {
    pub collection: String,
    pub dataset_id: String,
    pub project_id: String,
    pub scope: Scope,
}

impl From<&Dataset> for DatasetRef {
    fn from(d: &Dataset) -> Self {
        Self {
            collection: d.collection.clone(),
            dataset_id: d.id.clone(),
            project_id: d.project_id.clone(),
            scope: d.scope,
        }
    }
}

/// Which part of a project a query reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// Every dataset the project owns.
    Project,
    /// One named dataset.
    Dataset(String),
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    let slug: String = trimmed.chars().take(SLUG_MAX).collect();
    if slug.is_empty() {
        "x".to_string()
    } else {
        slug
    }
}

fn hash8(name: &str) -> String {
    let digest = Sha256::digest(name.trim().as_bytes());
    format!("{:x}", digest)[..8].to_string()
}

/// Deterministic collection name. Global scope ignores the names.
pub fn collection_name(scope: Scope, project: &str, dataset: &str) -> String {
    match scope {
        Scope::Global => GLOBAL_COLLECTION.to_string(),
        Scope::Project => format!("p_{}_{}", slug(project), hash8(project)),
        Scope::Dataset => format!(
            "p_{}_{}__d_{}_{}",
            slug(project),
            hash8(project),
            slug(dataset),
            hash8(dataset)
        ),
    }
}

/// Registry of projects and datasets.
///
/// Get-or-create operations must be idempotent and atomic per name:
/// concurrent callers asking for the same name get the same record.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_or_create_project(&self, name: &str) -> Result<Project>;

    async fn find_project(&self, name: &str) -> Result<Option<Project>>;

    /// Fails with [`LodestoneError::ScopeResolution`] when the dataset
    /// exists with a different scope.
    async fn get_or_create_dataset(
        &self,
        project: &Project,
        name: &str,
        scope: Scope,
    ) -> Result<Dataset>;

    async fn find_dataset(&self, project_id: &str, name: &str) -> Result<Option<Dataset>>;

    async fn datasets_for_project(&self, project_id: &str) -> Result<Vec<Dataset>>;

    /// Every dataset with `global` scope, whichever project owns it.
    async fn global_datasets(&self) -> Result<Vec<Dataset>>;

    async fn set_active(&self, dataset_id: &str, active: bool) -> Result<()>;

    async fn list_projects(&self) -> Result<Vec<Project>>;
}

/// Build the dataset record a catalog stores on first reference.
pub fn new_dataset(project: &Project, name: &str, scope: Scope) -> Dataset {
    Dataset {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        project_id: project.id.clone(),
        scope,
        active: true,
        collection: collection_name(scope, &project.name, name),
        created_at: chrono::Utc::now().timestamp(),
    }
}

pub fn new_project(name: &str) -> Project {
    Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        created_at: chrono::Utc::now().timestamp(),
    }
}

/// Reject a reference to an existing dataset under a different scope.
pub fn ensure_scope(existing: &Dataset, requested: Scope) -> Result<()> {
    if existing.scope == requested {
        Ok(())
    } else {
        Err(LodestoneError::ScopeResolution(format!(
            "dataset '{}' already exists with scope '{}', requested '{}'",
            existing.name, existing.scope, requested
        )))
    }
}

fn require_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LodestoneError::ScopeResolution(format!(
            "{} name must not be empty",
            kind
        )));
    }
    Ok(())
}

/// Resolve the write target for an ingestion job.
///
/// With `strict`, unknown projects or datasets are an error instead of
/// being created.
pub async fn resolve(
    catalog: &dyn Catalog,
    project: &str,
    dataset: &str,
    scope: Scope,
    strict: bool,
) -> Result<ResolvedTarget> {
    require_name("project", project)?;
    require_name("dataset", dataset)?;

    let (project, dataset) = if strict {
        let project = catalog.find_project(project.trim()).await?.ok_or_else(|| {
            LodestoneError::ScopeResolution(format!("unknown project '{}'", project))
        })?;
        let dataset = catalog
            .find_dataset(&project.id, dataset.trim())
            .await?
            .ok_or_else(|| {
                LodestoneError::ScopeResolution(format!(
                    "unknown dataset '{}' in project '{}'",
                    dataset, project.name
                ))
            })?;
        ensure_scope(&dataset, scope)?;
        (project, dataset)
    } else {
        let project = catalog.get_or_create_project(project.trim()).await?;
        let dataset = catalog
            .get_or_create_dataset(&project, dataset.trim(), scope)
            .await?;
        (project, dataset)
    };

    tracing::debug!(
        project = %project.name,
        dataset = %dataset.name,
        collection = %dataset.collection,
        "resolved ingestion target"
    );

    Ok(ResolvedTarget {
        project_id: project.id,
        dataset_id: dataset.id,
        scope: dataset.scope,
        collection: dataset.collection,
    })
}

/// Datasets readable by a query against `project`.
///
/// An unknown project, or an unknown dataset under [`ScopeFilter::Dataset`],
/// contributes nothing; the result may still hold global datasets.
pub async fn accessible_datasets(
    catalog: &dyn Catalog,
    project: &str,
    filter: &ScopeFilter,
    include_global: bool,
) -> Result<BTreeSet<DatasetRef>> {
    let mut out = BTreeSet::new();

    if let Some(project) = catalog.find_project(project.trim()).await? {
        match filter {
            ScopeFilter::Project => {
                for d in catalog.datasets_for_project(&project.id).await? {
                    if d.active {
                        out.insert(DatasetRef::from(&d));
                    }
                }
            }
            ScopeFilter::Dataset(name) => {
                if let Some(d) = catalog.find_dataset(&project.id, name.trim()).await? {
                    if d.active {
                        out.insert(DatasetRef::from(&d));
                    }
                }
            }
        }
    }

    if include_global {
        for d in catalog.global_datasets().await? {
            if d.active {
                out.insert(DatasetRef::from(&d));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert_eq!(collection_name(Scope::Global, "acme", "docs"), "global");

        let project = collection_name(Scope::Project, "Acme Corp", "docs");
        assert!(project.starts_with("p_acme_corp_"));
        assert_eq!(project.len(), "p_acme_corp_".len() + 8);

        let dataset = collection_name(Scope::Dataset, "Acme Corp", "API Docs");
        assert!(dataset.starts_with(&format!("{}__d_api_docs_", project)));
    }

    #[test]
    fn test_collection_names_are_pure_and_distinct() {
        assert_eq!(
            collection_name(Scope::Dataset, "acme", "docs"),
            collection_name(Scope::Dataset, "acme", "docs")
        );
        assert_ne!(
            collection_name(Scope::Project, "acme-web", "x"),
            collection_name(Scope::Project, "acme web", "x")
        );
    }

    #[test]
    fn test_slug_edge_cases() {
        assert_eq!(slug("  --  "), "x");
        assert_eq!(slug("Hello, World!"), "hello_world");
        assert_eq!(slug(&"a".repeat(50)).len(), SLUG_MAX);
    }

    async fn lattice() -> (InMemoryCatalog, ResolvedTarget, ResolvedTarget, ResolvedTarget) {
        let catalog = InMemoryCatalog::new();
        let d1 = resolve(&catalog, "p1", "d1", Scope::Dataset, false).await.unwrap();
        let d2 = resolve(&catalog, "p1", "d2", Scope::Project, false).await.unwrap();
        let g = resolve(&catalog, "shared", "handbook", Scope::Global, false)
            .await
            .unwrap();
        (catalog, d1, d2, g)
    }

    fn ids(set: &BTreeSet<DatasetRef>) -> BTreeSet<String> {
        set.iter().map(|d| d.dataset_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let catalog = InMemoryCatalog::new();
        let a = resolve(&catalog, "p1", "d1", Scope::Dataset, false).await.unwrap();
        let b = resolve(&catalog, "p1", "d1", Scope::Dataset, false).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(catalog.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_scope_conflict() {
        let catalog = InMemoryCatalog::new();
        resolve(&catalog, "p1", "d1", Scope::Dataset, false).await.unwrap();
        let err = resolve(&catalog, "p1", "d1", Scope::Project, false)
            .await
            .unwrap_err();
        assert!(matches!(err, LodestoneError::ScopeResolution(_)));
    }

    #[tokio::test]
    async fn test_resolve_strict_does_not_create() {
        let catalog = InMemoryCatalog::new();
        let err = resolve(&catalog, "p1", "d1", Scope::Dataset, true)
            .await
            .unwrap_err();
        assert!(matches!(err, LodestoneError::ScopeResolution(_)));
        assert!(catalog.list_projects().await.unwrap().is_empty());

        resolve(&catalog, "p1", "d1", Scope::Dataset, false).await.unwrap();
        assert!(resolve(&catalog, "p1", "d1", Scope::Dataset, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_rejects_empty_names() {
        let catalog = InMemoryCatalog::new();
        assert!(resolve(&catalog, " ", "d1", Scope::Dataset, false).await.is_err());
        assert!(resolve(&catalog, "p1", "", Scope::Dataset, false).await.is_err());
    }

    #[tokio::test]
    async fn test_lattice_project_request() {
        let (catalog, d1, d2, g) = lattice().await;
        let set = accessible_datasets(&catalog, "p1", &ScopeFilter::Project, true)
            .await
            .unwrap();
        assert_eq!(
            ids(&set),
            BTreeSet::from([d1.dataset_id, d2.dataset_id, g.dataset_id])
        );
    }

    #[tokio::test]
    async fn test_lattice_dataset_request() {
        let (catalog, d1, _d2, g) = lattice().await;
        let set = accessible_datasets(
            &catalog,
            "p1",
            &ScopeFilter::Dataset("d1".to_string()),
            true,
        )
        .await
        .unwrap();
        assert_eq!(ids(&set), BTreeSet::from([d1.dataset_id, g.dataset_id]));
    }

    #[tokio::test]
    async fn test_lattice_excluding_global() {
        let (catalog, _d1, d2, _g) = lattice().await;
        let set = accessible_datasets(
            &catalog,
            "p1",
            &ScopeFilter::Dataset("d2".to_string()),
            false,
        )
        .await
        .unwrap();
        assert_eq!(ids(&set), BTreeSet::from([d2.dataset_id]));
    }

    #[tokio::test]
    async fn test_lattice_other_project_sees_only_global() {
        let (catalog, _d1, _d2, g) = lattice().await;
        resolve(&catalog, "p2", "notes", Scope::Dataset, false).await.unwrap();
        let set = accessible_datasets(
            &catalog,
            "p2",
            &ScopeFilter::Dataset("d1".to_string()),
            true,
        )
        .await
        .unwrap();
        assert_eq!(ids(&set), BTreeSet::from([g.dataset_id.clone()]));

        let unknown = accessible_datasets(&catalog, "nope", &ScopeFilter::Project, true)
            .await
            .unwrap();
        assert_eq!(ids(&unknown), BTreeSet::from([g.dataset_id]));
    }

    #[tokio::test]
    async fn test_inactive_datasets_are_hidden() {
        let (catalog, d1, d2, g) = lattice().await;
        catalog.set_active(&g.dataset_id, false).await.unwrap();
        let set = accessible_datasets(&catalog, "p1", &ScopeFilter::Project, true)
            .await
            .unwrap();
        assert_eq!(ids(&set), BTreeSet::from([d1.dataset_id, d2.dataset_id]));
    }
}
