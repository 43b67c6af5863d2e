//! Reciprocal Rank Fusion of dense and sparse result lists.
//!
//! `score(id) = Σ 1 / (k + rank)` over the lists `id` appears in, with
//! 1-based ranks. Only ranks matter, so the fused order does not depend on
//! how the two similarity measures are scaled. Ties are broken by id.

use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_RRF_K: f64 = 60.0;

/// One fused entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub id: String,
    pub score: f64,
    /// 1-based rank in the dense list, if present.
    pub dense_rank: Option<usize>,
    /// 1-based rank in the sparse list, if present.
    pub sparse_rank: Option<usize>,
}

/// Fuse two ranked id lists, best first.
///
/// An id listed twice in the same list keeps its best rank.
pub fn reciprocal_rank_fusion<S: AsRef<str>>(dense: &[S], sparse: &[S], k: f64) -> Vec<Fused> {
    let mut entries: HashMap<&str, Fused> = HashMap::new();

    for (i, id) in dense.iter().enumerate() {
        let id = id.as_ref();
        let entry = entries.entry(id).or_insert_with(|| Fused {
            id: id.to_string(),
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
        });
        if entry.dense_rank.is_none() {
            entry.dense_rank = Some(i + 1);
            entry.score += 1.0 / (k + (i + 1) as f64);
        }
    }

    for (i, id) in sparse.iter().enumerate() {
        let id = id.as_ref();
        let entry = entries.entry(id).or_insert_with(|| Fused {
            id: id.to_string(),
            score: 0.0,
            dense_rank: None,
            sparse_rank: None,
        });
        if entry.sparse_rank.is_none() {
            entry.sparse_rank = Some(i + 1);
            entry.score += 1.0 / (k + (i + 1) as f64);
        }
    }

    let mut fused: Vec<Fused> = entries.into_values().collect();
    fused.sort_by(compare_fused);
    fused
}

/// Fusion key of a stored record. Chunk ids are content addressed, so the
/// same chunk indexed into two datasets is two records.
pub fn record_key(dataset_id: &str, id: &str) -> String {
    format!("{}\u{1f}{}", dataset_id, id)
}

/// Descending score, then ascending id.
pub fn compare_fused(a: &Fused, b: &Fused) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}
