//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/lodestone.sqlite"
//!
//! [chunking]
//! max_chars = 1000
//! overlap_chars = 100
//!
//! [embedding]
//! batch_size = 32
//! concurrency = 16
//!
//! [embedding.text]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [embedding.code]          # optional; falls back to [embedding.text]
//! provider = "ollama"
//! model = "nomic-embed-code"
//! dims = 1536
//!
//! [sparse]
//! enabled = true
//! url = "http://localhost:8081"
//!
//! [rerank]
//! enabled = true
//! url = "http://localhost:8082"
//!
//! [ingest]
//! max_in_flight_batches = 3
//!
//! [retrieval]
//! top_k = 10
//! ```
//!
//! Every section except `[db]` is optional.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use lodestone_core::chunk::ChunkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sparse: SparseConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_code_threshold")]
    pub code_threshold: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
            code_threshold: default_code_threshold(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chars: self.max_chars,
            overlap_chars: self.overlap_chars,
            code_threshold: self.code_threshold,
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    100
}
fn default_code_threshold() -> f32 {
    0.5
}

/// One dense model endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL (Ollama, or an OpenAI-compatible server).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub text: ModelConfig,
    /// Code model. Absent means code chunks use the text model.
    #[serde(default)]
    pub code: Option<ModelConfig>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            text: ModelConfig::default(),
            code: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn code_model(&self) -> &ModelConfig {
        self.code.as_ref().unwrap_or(&self.text)
    }
}

fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    16
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SparseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sparse_url")]
    pub url: String,
    #[serde(default = "default_sparse_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_sparse_url(),
            model: default_sparse_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_sparse_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_sparse_model() -> String {
    "splade".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    /// Candidates fetched for reranking before truncating to `top_k`.
    #[serde(default = "default_rerank_pool")]
    pub pool: usize,
    #[serde(default = "default_rerank_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_rerank_url(),
            model: default_rerank_model(),
            pool: default_rerank_pool(),
            max_chars: default_rerank_max_chars(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_rerank_url() -> String {
    "http://localhost:8082".to_string()
}
fn default_rerank_model() -> String {
    "cross-encoder".to_string()
}
fn default_rerank_pool() -> usize {
    150
}
fn default_rerank_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,
    #[serde(default = "default_batch_retries")]
    pub batch_retries: u32,
    /// Fail instead of creating unknown projects and datasets.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_in_flight_batches: default_max_in_flight(),
            batch_retries: default_batch_retries(),
            strict: false,
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_max_in_flight() -> usize {
    3
}
fn default_batch_retries() -> u32 {
    1
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Per-signal candidates fetched from each collection.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_include_global")]
    pub include_global: bool,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_collection_concurrency")]
    pub collection_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            include_global: default_include_global(),
            rrf_k: default_rrf_k(),
            collection_concurrency: default_collection_concurrency(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_candidate_k() -> usize {
    50
}
fn default_include_global() -> bool {
    true
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_collection_concurrency() -> usize {
    4
}

fn validate_model(section: &str, model: &ModelConfig) -> Result<()> {
    match model.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider in [{}]: '{}'. Must be disabled, openai, ollama, or local.",
            section,
            other
        ),
    }
    if model.is_enabled() && model.provider != "local" {
        if model.dims.unwrap_or(0) == 0 {
            bail!(
                "{}.dims must be > 0 when provider is '{}'",
                section,
                model.provider
            );
        }
        if model.model.is_none() {
            bail!(
                "{}.model must be specified when provider is '{}'",
                section,
                model.provider
            );
        }
    }
    Ok(())
}

/// Check cross-field constraints on a parsed config.
pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }
    if !(0.0..=1.0).contains(&config.chunking.code_threshold) {
        bail!("chunking.code_threshold must be in [0.0, 1.0]");
    }

    validate_model("embedding.text", &config.embedding.text)?;
    if let Some(code) = &config.embedding.code {
        validate_model("embedding.code", code)?;
        if code.is_enabled() && config.embedding.text.is_enabled() && code.dims != config.embedding.text.dims {
            bail!("embedding.code.dims must equal embedding.text.dims: vectors share one index");
        }
    }
    if config.embedding.batch_size == 0 || config.embedding.concurrency == 0 {
        bail!("embedding.batch_size and embedding.concurrency must be > 0");
    }

    if config.ingest.max_in_flight_batches == 0 {
        bail!("ingest.max_in_flight_batches must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.rrf_k <= 0.0 {
        bail!("retrieval.rrf_k must be > 0");
    }
    if config.rerank.enabled && config.rerank.pool < config.retrieval.top_k {
        bail!("rerank.pool must be >= retrieval.top_k");
    }
    Ok(())
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/l.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 100);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.embedding.concurrency, 16);
        assert_eq!(config.ingest.max_in_flight_batches, 3);
        assert_eq!(config.ingest.batch_retries, 1);
        assert_eq!(config.rerank.pool, 150);
        assert_eq!(config.rerank.max_chars, 2000);
        assert!(!config.sparse.enabled);
        assert_eq!(config.embedding.code_model().provider, "disabled");
    }

    #[test]
    fn test_code_model_falls_back_to_text() {
        let config = parse_config(
            r#"
[db]
path = "x.sqlite"

[embedding.text]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
"#,
        )
        .unwrap();
        assert_eq!(config.embedding.code_model().model.as_deref(), Some("nomic-embed-text"));
    }

    #[test]
    fn test_mismatched_model_dims_rejected() {
        let err = parse_config(
            r#"
[db]
path = "x.sqlite"

[embedding.text]
provider = "ollama"
model = "a"
dims = 768

[embedding.code]
provider = "ollama"
model = "b"
dims = 1024
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[embedding.text]\nprovider = \"magic\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_overlap_must_be_below_budget() {
        assert!(parse_config("[db]\npath = \"x\"\n[chunking]\nmax_chars = 100\noverlap_chars = 100\n").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../../../config/lodestone.example.toml")).unwrap();
        assert_eq!(config.embedding.text.provider, "openai");
        assert_eq!(config.embedding.code_model().provider, "ollama");
        assert_eq!(config.ingest.exclude_globs.len(), 2);
        assert_eq!(config.retrieval.rrf_k, 60.0);
    }
}
