//! Result shape and cross-collection fusion for hybrid queries.
//!
//! Each collection returns its own fused candidate list from
//! [`Store::search`](crate::store::Store::search). Per-collection RRF ranks
//! are not comparable across collections, so [`merge_collections`] pools
//! the candidates, rebuilds one dense and one sparse ranking over the
//! union from the raw per-signal scores, and fuses again.
//!
//! # Global fusion
//!
//! 1. Dense list: candidates with a dense score, sorted by cosine (desc), id (asc).
//! 2. Sparse list: candidates with a sparse score, sorted by dot (desc), id (asc).
//! 3. RRF over both lists with `k`.
//! 4. Truncate to `limit`.

use std::collections::HashMap;

use serde::Serialize;

use crate::fusion::{reciprocal_rank_fusion, record_key};
use crate::models::{Position, Provenance, Scope};
use crate::store::Candidate;

/// Per-signal scores behind a result's final position.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreExplanation {
    /// Cosine similarity to the dense query, if the chunk made the dense list.
    pub dense_score: Option<f32>,
    /// Sparse dot product, if the chunk made the sparse list.
    pub sparse_score: Option<f32>,
    /// 1-based rank in the global dense list.
    pub dense_rank: Option<usize>,
    /// 1-based rank in the global sparse list.
    pub sparse_rank: Option<usize>,
    pub fused_score: f64,
    /// Cross-encoder score, when reranking ran.
    pub rerank_score: Option<f32>,
}

/// One ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Chunk UUID.
    pub id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub scope: Scope,
    pub collection: String,
    /// Normalized path or URL.
    pub source_key: String,
    pub position: Position,
    pub content: String,
    pub summary: Option<String>,
    pub is_code: bool,
    pub language: Option<String>,
    pub provenance: Provenance,
    /// Final ordering score: `rerank_score` when present, else `fused_score`.
    pub score: f64,
    pub scores: ScoreExplanation,
}

impl SearchHit {
    fn from_candidate(c: Candidate) -> Self {
        Self {
            id: c.chunk.id,
            project_id: c.chunk.project_id,
            dataset_id: c.chunk.dataset_id,
            scope: c.chunk.scope,
            collection: c.collection,
            source_key: c.chunk.source_key,
            position: c.chunk.position,
            content: c.chunk.content,
            summary: c.chunk.summary,
            is_code: c.chunk.is_code,
            language: c.chunk.language,
            provenance: c.chunk.provenance,
            score: 0.0,
            scores: ScoreExplanation {
                dense_score: c.dense_score,
                sparse_score: c.sparse_score,
                ..ScoreExplanation::default()
            },
        }
    }

    fn key(&self) -> String {
        record_key(&self.dataset_id, &self.id)
    }
}

fn rank_by<F>(hits: &[(String, SearchHit)], score: F) -> Vec<&str>
where
    F: Fn(&SearchHit) -> Option<f32>,
{
    let mut scored: Vec<(f32, &str)> = hits
        .iter()
        .filter_map(|(key, h)| score(h).map(|s| (s, key.as_str())))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(b.1))
    });
    scored.into_iter().map(|(_, key)| key).collect()
}

/// Pool per-collection candidates and re-fuse them into one ranking.
///
/// Records are keyed by `(dataset_id, id)`: identical content in two
/// datasets yields two hits. A record seen in several lists keeps its best
/// per-signal scores.
pub fn merge_collections(lists: Vec<Vec<Candidate>>, k: f64, limit: usize) -> Vec<SearchHit> {
    let mut pooled: HashMap<String, SearchHit> = HashMap::new();
    for candidate in lists.into_iter().flatten() {
        let hit = SearchHit::from_candidate(candidate);
        match pooled.get_mut(&hit.key()) {
            Some(existing) => {
                existing.scores.dense_score = max_opt(existing.scores.dense_score, hit.scores.dense_score);
                existing.scores.sparse_score =
                    max_opt(existing.scores.sparse_score, hit.scores.sparse_score);
            }
            None => {
                pooled.insert(hit.key(), hit);
            }
        }
    }

    let hits: Vec<(String, SearchHit)> = pooled.into_iter().collect();
    let dense = rank_by(&hits, |h| h.scores.dense_score);
    let sparse = rank_by(&hits, |h| h.scores.sparse_score);
    let fused = reciprocal_rank_fusion(&dense, &sparse, k);

    let mut by_key: HashMap<&str, &SearchHit> =
        hits.iter().map(|(key, h)| (key.as_str(), h)).collect();
    fused
        .into_iter()
        .take(limit)
        .filter_map(|f| {
            let mut hit = by_key.remove(f.id.as_str())?.clone();
            hit.scores.dense_rank = f.dense_rank;
            hit.scores.sparse_rank = f.sparse_rank;
            hit.scores.fused_score = f.score;
            hit.score = f.score;
            Some(hit)
        })
        .collect()
}

fn max_opt(a: Option<f32>, b: Option<f32>) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}
