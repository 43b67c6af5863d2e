//! Client for a TEI-compatible cross-encoder (`POST {url}/rerank`).
//!
//! The service answers `[{"index": n, "score": s}, ...]` in relevance
//! order; scores are mapped back to input order before they reach
//! [`lodestone_core::rerank::rerank`].

use std::sync::Arc;

use async_trait::async_trait;

use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::rerank::RerankProvider;

use crate::config::RerankConfig;
use crate::embedding::http::{build_client, post_json, RetryPolicy};

pub struct HttpReranker {
    model: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig, max_retries: u32) -> anyhow::Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(max_retries),
        })
    }
}

#[async_trait]
impl RerankProvider for HttpReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "query": query,
            "texts": texts,
            "truncate": true,
        });
        let json = post_json(
            &self.client,
            "rerank",
            &format!("{}/rerank", self.url),
            None,
            &body,
            &self.policy,
        )
        .await?;
        parse_rerank_response(&json, texts.len())
    }
}

/// Map `[{"index", "score"}]` back to one score per input, in input order.
pub fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    let bad = |what: String| LodestoneError::permanent("rerank", format!("invalid response: {}", what));

    let entries = json
        .as_array()
        .ok_or_else(|| bad("expected an array".to_string()))?;
    let mut scores: Vec<Option<f32>> = vec![None; expected];
    for entry in entries {
        let index = entry
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| bad("missing index".to_string()))? as usize;
        let score = entry
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| bad("missing score".to_string()))? as f32;
        match scores.get_mut(index) {
            Some(slot) => *slot = Some(score),
            None => return Err(bad(format!("index {} out of range", index))),
        }
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| bad(format!("no score for input {}", i))))
        .collect()
}

/// `None` when reranking is disabled.
pub fn create_reranker(
    config: &RerankConfig,
    max_retries: u32,
) -> anyhow::Result<Option<Arc<dyn RerankProvider>>> {
    if !config.enabled {
        return Ok(None);
    }
    Ok(Some(Arc::new(HttpReranker::new(config, max_retries)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_maps_back_to_input_order() {
        let json = json!([
            {"index": 2, "score": 0.9},
            {"index": 0, "score": 0.5},
            {"index": 1, "score": 0.1}
        ]);
        assert_eq!(parse_rerank_response(&json, 3).unwrap(), vec![0.5, 0.1, 0.9]);
    }

    #[test]
    fn test_parse_rejects_missing_or_out_of_range() {
        let partial = json!([{"index": 0, "score": 0.5}]);
        assert!(parse_rerank_response(&partial, 2).is_err());
        let out_of_range = json!([{"index": 5, "score": 0.5}]);
        assert!(parse_rerank_response(&out_of_range, 1).is_err());
    }

    #[test]
    fn test_disabled_creates_nothing() {
        assert!(create_reranker(&RerankConfig::default(), 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_score_posts_query_and_texts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .and(body_partial_json(json!({"query": "retry", "truncate": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"index": 1, "score": 3.0},
                {"index": 0, "score": -1.0}
            ])))
            .mount(&server)
            .await;

        let config = RerankConfig {
            enabled: true,
            url: server.uri(),
            ..RerankConfig::default()
        };
        let reranker = create_reranker(&config, 0).unwrap().unwrap();
        let scores = reranker
            .score("retry", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![-1.0, 3.0]);
    }
}
