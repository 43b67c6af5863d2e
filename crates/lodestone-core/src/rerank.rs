//! Cross-encoder reranking of fused results.
//!
//! The scoring model is an external oracle behind [`RerankProvider`]. A
//! failed or malformed rerank never fails the query: the pre-rerank order
//! is returned and the failure is logged at `warn`.

use async_trait::async_trait;

use crate::error::Result;
use crate::search::SearchHit;

pub const DEFAULT_RERANK_MAX_CHARS: usize = 2000;

/// Scores `(query, text)` pairs; higher is more relevant.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// One score per input text, in input order.
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

/// First `max_chars` characters of `text`, never splitting a char.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Rescore `hits` and keep the best `limit`.
///
/// Every hit that was scored gets `scores.rerank_score` and `score` set to
/// it. Ties keep the fused order.
pub async fn rerank(
    provider: &dyn RerankProvider,
    query: &str,
    mut hits: Vec<SearchHit>,
    limit: usize,
    max_chars: usize,
) -> Vec<SearchHit> {
    if hits.is_empty() {
        return hits;
    }

    let texts: Vec<String> = hits
        .iter()
        .map(|h| truncate_chars(&h.content, max_chars).to_string())
        .collect();

    let scores = match provider.score(query, &texts).await {
        Ok(scores) if scores.len() == hits.len() => scores,
        Ok(scores) => {
            tracing::warn!(
                model = provider.model_name(),
                expected = hits.len(),
                got = scores.len(),
                "reranker returned wrong number of scores; keeping fused order"
            );
            hits.truncate(limit);
            return hits;
        }
        Err(e) => {
            tracing::warn!(
                model = provider.model_name(),
                error = %e,
                "rerank failed; keeping fused order"
            );
            hits.truncate(limit);
            return hits;
        }
    };

    for (hit, score) in hits.iter_mut().zip(scores) {
        hit.scores.rerank_score = Some(score);
        hit.score = score as f64;
    }
    // Stable sort: equal scores keep fused order.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LodestoneError;
    use crate::models::{Position, Provenance, Scope};
    use crate::search::ScoreExplanation;
    use std::sync::Mutex;

    struct LengthScorer {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RerankProvider for LengthScorer {
        fn model_name(&self) -> &str {
            "length"
        }
        async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|t| t.chars().count() as f32).collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl RerankProvider for Broken {
        fn model_name(&self) -> &str {
            "broken"
        }
        async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
            Err(LodestoneError::transient("rerank", "connection refused"))
        }
    }

    fn hit(id: &str, content: &str, fused: f64) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            project_id: "p".to_string(),
            dataset_id: "d".to_string(),
            scope: Scope::Project,
            collection: "c".to_string(),
            source_key: "k".to_string(),
            position: Position::Offsets { start: 0, end: 1 },
            content: content.to_string(),
            summary: None,
            is_code: false,
            language: None,
            provenance: Provenance::new(),
            score: fused,
            scores: ScoreExplanation {
                fused_score: fused,
                ..ScoreExplanation::default()
            },
        }
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let scorer = LengthScorer {
            seen: Mutex::new(Vec::new()),
        };
        let hits = vec![hit("a", "x", 0.03), hit("b", "xxx", 0.02), hit("c", "xx", 0.01)];
        let out = rerank(&scorer, "q", hits, 2, 100).await;
        let ids: Vec<&str> = out.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(out[0].scores.rerank_score, Some(3.0));
        assert_eq!(out[0].scores.fused_score, 0.02);
    }

    #[tokio::test]
    async fn test_rerank_truncates_texts() {
        let scorer = LengthScorer {
            seen: Mutex::new(Vec::new()),
        };
        rerank(&scorer, "q", vec![hit("a", &"é".repeat(50), 0.1)], 5, 10).await;
        assert_eq!(scorer.seen.lock().unwrap()[0].chars().count(), 10);
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_fused_order() {
        let hits = vec![hit("a", "x", 0.03), hit("b", "xxx", 0.02), hit("c", "xx", 0.01)];
        let out = rerank(&Broken, "q", hits.clone(), 10, 100).await;
        assert_eq!(out, hits);
        assert!(out.iter().all(|h| h.scores.rerank_score.is_none()));
    }
}
