//! Client for a TEI-compatible sparse encoder (`POST {url}/embed_sparse`).

use async_trait::async_trait;

use lodestone_core::embedding::SparseEncoder;
use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::SparseVector;

use super::http::{build_client, post_json, RetryPolicy};
use crate::config::SparseConfig;

pub struct HttpSparseEncoder {
    model: String,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpSparseEncoder {
    pub fn new(config: &SparseConfig, max_retries: u32) -> anyhow::Result<Self> {
        Ok(Self {
            model: config.model.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(max_retries),
        })
    }

    #[cfg(test)]
    fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl SparseEncoder for HttpSparseEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        let body = serde_json::json!({ "inputs": texts });
        let json = post_json(
            &self.client,
            "sparse",
            &format!("{}/embed_sparse", self.url),
            None,
            &body,
            &self.policy,
        )
        .await?;
        let vectors = parse_sparse_response(&json)?;
        if vectors.len() != texts.len() {
            return Err(LodestoneError::permanent(
                "sparse",
                format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}

/// Parse `[[{"index": u32, "value": f32}, ...], ...]`.
pub fn parse_sparse_response(json: &serde_json::Value) -> Result<Vec<SparseVector>> {
    let bad = |what: &str| LodestoneError::permanent("sparse", format!("invalid response: {}", what));

    json.as_array()
        .ok_or_else(|| bad("expected an array of vectors"))?
        .iter()
        .map(|entries| {
            let entries = entries
                .as_array()
                .ok_or_else(|| bad("vector is not an array"))?;
            let mut pairs = Vec::with_capacity(entries.len());
            for entry in entries {
                let index = entry
                    .get("index")
                    .and_then(|i| i.as_u64())
                    .ok_or_else(|| bad("missing index"))?;
                let value = entry
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| bad("missing value"))?;
                pairs.push((index as u32, value as f32));
            }
            Ok(SparseVector::from_pairs(pairs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> SparseConfig {
        SparseConfig {
            enabled: true,
            url,
            ..SparseConfig::default()
        }
    }

    #[test]
    fn test_parse_sparse_response() {
        let json = json!([
            [{"index": 9, "value": 0.5}, {"index": 2, "value": 1.0}],
            []
        ]);
        let vectors = parse_sparse_response(&json).unwrap();
        assert_eq!(vectors[0].indices, vec![2, 9]);
        assert_eq!(vectors[0].values, vec![1.0, 0.5]);
        assert!(vectors[1].is_empty());
    }

    #[test]
    fn test_parse_sparse_rejects_bad_entries() {
        assert!(parse_sparse_response(&json!({"x": 1})).is_err());
        assert!(parse_sparse_response(&json!([[{"index": 1}]])).is_err());
    }

    #[tokio::test]
    async fn test_encode_calls_embed_sparse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed_sparse"))
            .and(body_json(json!({"inputs": ["fn main"]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([[{"index": 4, "value": 2.0}]])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let encoder = HttpSparseEncoder::new(&config(server.uri()), 0).unwrap();
        let vectors = encoder.encode(&["fn main".to_string()]).await.unwrap();
        assert_eq!(vectors[0].indices, vec![4]);
    }

    #[tokio::test]
    async fn test_encode_count_mismatch_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let encoder = HttpSparseEncoder::new(&config(server.uri()), 2)
            .unwrap()
            .with_policy(RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            });
        let err = encoder.encode(&["a".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
