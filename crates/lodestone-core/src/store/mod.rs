//! Storage abstraction for Lodestone.
//!
//! The [`Store`] trait persists canonical [`Chunk`]s with their dense and
//! sparse vectors, grouped into named collections, and answers hybrid
//! similarity queries against one collection at a time.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Upsert semantics
//!
//! Records are keyed by `(dataset_id, chunk id)`. A chunk is also bound to a
//! *slot*,
//! `(dataset_id, source_key, position kind, position start)`:
//!
//! - same id already stored: overwritten, counted as `updated`
//! - different id in the same slot: old record replaced, counted as `updated`
//! - otherwise: `inserted`
//!
//! Every stored dense vector has the same dimensionality; the first write
//! fixes it and later mismatches fail with [`LodestoneError::Storage`].

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{LodestoneError, Result};
use crate::fusion::{reciprocal_rank_fusion, record_key};
use crate::models::{Chunk, PositionKind, SparseVector};

pub use memory::InMemoryStore;

/// Structured filters, AND-combined. `None` means "no constraint".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    /// Restrict to these datasets (the accessible set).
    pub dataset_ids: Option<BTreeSet<String>>,
    pub project_id: Option<String>,
    /// Value of the `repo` provenance key.
    pub repo: Option<String>,
    pub language: Option<String>,
    pub is_code: Option<bool>,
    /// Prefix of the normalized path or URL.
    pub source_prefix: Option<String>,
}

impl SearchFilter {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(ids) = &self.dataset_ids {
            if !ids.contains(&chunk.dataset_id) {
                return false;
            }
        }
        if let Some(project_id) = &self.project_id {
            if &chunk.project_id != project_id {
                return false;
            }
        }
        if let Some(repo) = &self.repo {
            if chunk.provenance.get("repo") != Some(repo) {
                return false;
            }
        }
        if let Some(language) = &self.language {
            if chunk.language.as_deref() != Some(language.as_str()) {
                return false;
            }
        }
        if let Some(is_code) = self.is_code {
            if chunk.is_code != is_code {
                return false;
            }
        }
        if let Some(prefix) = &self.source_prefix {
            if !chunk.source_key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A hybrid similarity query against one collection.
#[derive(Debug, Clone)]
pub struct StoreQuery {
    /// Dense query vector. Empty disables the dense signal.
    pub dense: Vec<f32>,
    /// Sparse query vector. `None` or empty disables the sparse signal.
    pub sparse: Option<SparseVector>,
    pub filter: SearchFilter,
    /// Length of each per-signal list and of the fused result.
    pub top_k: usize,
    /// RRF constant for fusing the two lists.
    pub rrf_k: f64,
}

/// A chunk returned from [`Store::search`] with its per-signal scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// The stored chunk, without vectors.
    pub chunk: Chunk,
    pub collection: String,
    pub dense_score: Option<f32>,
    pub sparse_score: Option<f32>,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub fused_score: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertReport {
    pub fn merge(&mut self, other: UpsertReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Logical position a chunk occupies within its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub dataset_id: String,
    pub source_key: String,
    pub kind: PositionKind,
    pub start: u64,
    pub part: u32,
}

impl SlotKey {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            dataset_id: chunk.dataset_id.clone(),
            source_key: chunk.source_key.clone(),
            kind: chunk.position.kind(),
            start: chunk.position.start(),
            part: chunk.part,
        }
    }
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](Store::upsert) | Insert or replace chunks in a collection |
/// | [`search`](Store::search) | Filtered hybrid similarity search |
/// | [`existing_ids`](Store::existing_ids) | Ids stored for one source |
/// | [`prune`](Store::prune) | Delete a source's chunks that are no longer produced |
/// | [`count`](Store::count) | Chunk count, optionally per dataset |
/// | [`collections`](Store::collections) | Names of non-empty collections |
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert embedded chunks into `collection`, creating it if needed.
    ///
    /// Chunks without a dense vector, or with a vector whose length differs
    /// from the store's, fail the whole call with `Storage`.
    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<UpsertReport>;

    /// Fused candidates from `collection`, best first.
    ///
    /// An unknown collection yields no candidates.
    async fn search(&self, collection: &str, query: &StoreQuery) -> Result<Vec<Candidate>>;

    async fn existing_ids(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
    ) -> Result<BTreeSet<String>>;

    /// Delete chunks of `source_key` whose id is not in `keep`. Returns the
    /// number deleted.
    async fn prune(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
        keep: &BTreeSet<String>,
    ) -> Result<usize>;

    async fn count(&self, collection: &str, dataset_id: Option<&str>) -> Result<usize>;

    async fn collections(&self) -> Result<Vec<String>>;
}

/// Check every chunk carries a dense vector of the expected length.
///
/// Returns the dimensionality to record when the store had none yet.
pub fn check_dims(expected: Option<usize>, chunks: &[Chunk]) -> Result<Option<usize>> {
    let mut dims = expected;
    for chunk in chunks {
        let len = chunk.dense_vector.len();
        if len == 0 {
            return Err(LodestoneError::storage(format!(
                "chunk {} has no dense vector",
                chunk.id
            )));
        }
        match dims {
            Some(d) if d != len => {
                return Err(LodestoneError::storage(format!(
                    "dimension mismatch for chunk {}: got {}, store holds {}",
                    chunk.id, len, d
                )));
            }
            Some(_) => {}
            None => dims = Some(len),
        }
    }
    Ok(dims)
}

fn by_score_then_id(a: &(f32, &Chunk), b: &(f32, &Chunk)) -> std::cmp::Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.1.id.cmp(&b.1.id))
        .then_with(|| a.1.dataset_id.cmp(&b.1.dataset_id))
}

/// Rank one collection's chunks for `query`.
///
/// Shared by backends that score in process: filters first, then builds
/// the dense (cosine) and sparse (dot > 0) lists, truncates each to
/// `top_k`, and fuses them.
pub fn rank_collection<'a>(
    collection: &str,
    chunks: impl IntoIterator<Item = &'a Chunk>,
    query: &StoreQuery,
) -> Vec<Candidate> {
    let eligible: Vec<&Chunk> = chunks
        .into_iter()
        .filter(|c| query.filter.matches(c))
        .collect();

    let mut dense: Vec<(f32, &Chunk)> = if query.dense.is_empty() {
        Vec::new()
    } else {
        eligible
            .iter()
            .filter(|c| c.dense_vector.len() == query.dense.len())
            .map(|c| (cosine_similarity(&query.dense, &c.dense_vector), *c))
            .collect()
    };
    dense.sort_by(by_score_then_id);
    dense.truncate(query.top_k);

    let mut sparse: Vec<(f32, &Chunk)> = match &query.sparse {
        Some(q) if !q.is_empty() => eligible
            .iter()
            .filter_map(|c| {
                let score = c.sparse_vector.as_ref().map(|v| v.dot(q)).unwrap_or(0.0);
                (score > 0.0).then_some((score, *c))
            })
            .collect(),
        _ => Vec::new(),
    };
    sparse.sort_by(by_score_then_id);
    sparse.truncate(query.top_k);

    let key = |(_, c): &(f32, &Chunk)| record_key(&c.dataset_id, &c.id);
    let dense_keys: Vec<String> = dense.iter().map(key).collect();
    let sparse_keys: Vec<String> = sparse.iter().map(key).collect();
    let fused = reciprocal_rank_fusion(&dense_keys, &sparse_keys, query.rrf_k);

    fused
        .into_iter()
        .take(query.top_k)
        .filter_map(|f| {
            let dense_score = f.dense_rank.map(|r| dense[r - 1].0);
            let sparse_score = f.sparse_rank.map(|r| sparse[r - 1].0);
            let chunk = f
                .dense_rank
                .map(|r| dense[r - 1].1)
                .or_else(|| f.sparse_rank.map(|r| sparse[r - 1].1))?;
            Some(Candidate {
                chunk: chunk.without_vectors(),
                collection: collection.to_string(),
                dense_score,
                sparse_score,
                dense_rank: f.dense_rank,
                sparse_rank: f.sparse_rank,
                fused_score: f.score,
            })
        })
        .collect()
}
