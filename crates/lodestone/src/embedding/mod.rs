//! Dense embedding providers and the sparse encoder client.
//!
//! Implementations of [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: rejects every batch; used when no model is configured.
//! - **[`OpenAIProvider`]**: `POST {url}/v1/embeddings` (OpenAI or a compatible server).
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//! - **`LocalProvider`**: in-process fastembed models (feature `local-embeddings-fastembed`).
//!
//! HTTP providers share [`http::post_json`] for retry and error
//! classification.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use lodestone::config::{EmbeddingConfig, ModelConfig};
//! # use lodestone::embedding::create_provider;
//! let config = EmbeddingConfig::default();
//! let provider = create_provider(&ModelConfig::default(), &config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

pub mod http;
pub mod sparse;

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use lodestone_core::embedding::EmbeddingProvider;
use lodestone_core::error::{LodestoneError, Result};

use crate::config::{EmbeddingConfig, ModelConfig};
use http::{build_client, post_json, RetryPolicy};

pub use sparse::HttpSparseEncoder;

// ============ Disabled Provider ============

/// Provider used when `provider = "disabled"`. Every batch fails
/// permanently, so ingestion records the chunks as failed.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(LodestoneError::permanent(
            "embedding",
            "embedding provider is disabled",
        ))
    }
}

// ============ OpenAI Provider ============

/// OpenAI embeddings API, or any server speaking the same protocol.
///
/// Requires `OPENAI_API_KEY` unless a custom `url` is configured.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAIProvider {
    pub fn new(model: &ModelConfig, config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let name = model
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding model required for OpenAI provider"))?;
        let dims = model
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        if api_key.is_none() && model.url.is_none() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        let url = model
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model: name,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "openai",
            &format!("{}/v1/embeddings", self.url),
            self.api_key.as_deref(),
            &body,
            &self.policy,
        )
        .await?;
        parse_openai_response(&json)
    }
}

fn malformed(service: &str, what: &str) -> LodestoneError {
    LodestoneError::permanent(service, format!("invalid response: {}", what))
}

fn parse_vector(service: &str, value: &serde_json::Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| malformed(service, "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| malformed(service, "embedding value is not a number"))
        })
        .collect()
}

/// Extract `data[].embedding`, ordered by `data[].index`.
pub fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("openai", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| malformed("openai", "missing embedding"))?;
        indexed.push((index, parse_vector("openai", embedding)?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Local Ollama instance (default `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaProvider {
    pub fn new(model: &ModelConfig, config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let name = model
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding model required for Ollama provider"))?;
        let dims = model
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding dims required for Ollama provider"))?;
        let url = model
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model: name,
            dims,
            url: url.trim_end_matches('/').to_string(),
            client: build_client(config.timeout_secs)?,
            policy: RetryPolicy::new(config.max_retries),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json(
            &self.client,
            "ollama",
            &format!("{}/api/embed", self.url),
            None,
            &body,
            &self.policy,
        )
        .await?;
        parse_ollama_response(&json)
    }
}

/// Extract the `embeddings` array of arrays.
pub fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("ollama", "missing embeddings array"))?
        .iter()
        .map(|e| parse_vector("ollama", e))
        .collect()
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
mod local {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use lodestone_core::embedding::EmbeddingProvider;
    use lodestone_core::error::{LodestoneError, Result};

    use crate::config::{EmbeddingConfig, ModelConfig};

    /// In-process embeddings. The model is downloaded on first use and
    /// loaded once.
    pub struct LocalProvider {
        model_name: String,
        dims: usize,
        batch_size: usize,
        model: Arc<Mutex<Option<fastembed::TextEmbedding>>>,
    }

    impl LocalProvider {
        pub fn new(model: &ModelConfig, config: &EmbeddingConfig) -> anyhow::Result<Self> {
            let model_name = model
                .model
                .clone()
                .unwrap_or_else(|| "bge-small-en-v1.5".to_string());
            fastembed_model(&model_name)?;
            let dims = model.dims.unwrap_or(match model_name.as_str() {
                "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "jina-embeddings-v2-base-code" => 768,
                "bge-large-en-v1.5" => 1024,
                _ => 384,
            });
            Ok(Self {
                model_name,
                dims,
                batch_size: config.batch_size,
                model: Arc::new(Mutex::new(None)),
            })
        }
    }

    fn fastembed_model(name: &str) -> anyhow::Result<fastembed::EmbeddingModel> {
        match name {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
            "jina-embeddings-v2-base-code" => Ok(fastembed::EmbeddingModel::JinaEmbeddingsV2BaseCode),
            other => anyhow::bail!(
                "Unknown local embedding model: '{}'. Supported models: \
                 all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
                 nomic-embed-text-v1.5, jina-embeddings-v2-base-code",
                other
            ),
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LocalProvider {
        fn model_name(&self) -> &str {
            &self.model_name
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let texts = texts.to_vec();
            let name = self.model_name.clone();
            let batch_size = self.batch_size;
            let slot = self.model.clone();

            tokio::task::spawn_blocking(move || {
                let mut guard = slot
                    .lock()
                    .map_err(|_| LodestoneError::permanent("local", "model lock poisoned"))?;
                if guard.is_none() {
                    let model = fastembed_model(&name)
                        .map_err(|e| LodestoneError::permanent("local", e))?;
                    let loaded = fastembed::TextEmbedding::try_new(
                        fastembed::InitOptions::new(model).with_show_download_progress(false),
                    )
                    .map_err(|e| LodestoneError::permanent("local", e))?;
                    *guard = Some(loaded);
                }
                match guard.as_mut() {
                    Some(model) => model
                        .embed(texts, Some(batch_size))
                        .map_err(|e| LodestoneError::permanent("local", e)),
                    None => Err(LodestoneError::permanent("local", "model not loaded")),
                }
            })
            .await
            .map_err(|e| LodestoneError::permanent("local", e))?
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalProvider;

/// Create the [`EmbeddingProvider`] for one model section.
///
/// | `provider` | Implementation |
/// |------------|----------------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings-fastembed`) |
pub fn create_provider(
    model: &ModelConfig,
    config: &EmbeddingConfig,
) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match model.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(model, config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(model, config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(model, config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_rejects_missing_data() {
        let err = parse_openai_response(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, LodestoneError::PermanentBatch { .. }));
    }

    #[test]
    fn test_parse_ollama() {
        let json = json!({"embeddings": [[0.5, 0.25], [1.0, 2.0]]});
        assert_eq!(
            parse_ollama_response(&json).unwrap(),
            vec![vec![0.5, 0.25], vec![1.0, 2.0]]
        );
        assert!(parse_ollama_response(&json!({"embeddings": [["x"]]})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_permanently() {
        let err = DisabledProvider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_ollama_provider_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(json!({"model": "nomic-embed-text"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.1, 0.2, 0.3]]})),
            )
            .mount(&server)
            .await;

        let model = ModelConfig {
            provider: "ollama".to_string(),
            model: Some("nomic-embed-text".to_string()),
            dims: Some(3),
            url: Some(server.uri()),
        };
        let provider = create_provider(&model, &EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.dims(), 3);
        let vectors = provider.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2, 0.3]]);
    }

    #[test]
    fn test_unknown_provider() {
        let model = ModelConfig {
            provider: "magic".to_string(),
            ..ModelConfig::default()
        };
        assert!(create_provider(&model, &EmbeddingConfig::default()).is_err());
    }
}
