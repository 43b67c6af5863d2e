//! Deterministic model fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lodestone::config::IngestConfig;
use lodestone::ingest::{IngestInput, IngestRequest, JobReport, Orchestrator};
use lodestone::progress::ProgressSink;
use lodestone::router::EmbeddingRouter;
use lodestone_core::chunk::{Chunker, ChunkerConfig};
use lodestone_core::embedding::{EmbeddingProvider, SparseEncoder};
use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::{Scope, SparseVector};
use lodestone_core::rerank::RerankProvider;
use lodestone_core::scope::{Catalog, InMemoryCatalog};
use lodestone_core::store::{InMemoryStore, Store};

pub const DIMS: usize = 16;

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
}

fn fnv(word: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in word.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Bag-of-words dense embedder: each word adds 1.0 to a hashed bucket.
/// Texts containing `poison` fail with a transient error.
pub struct KeywordEmbedder {
    name: &'static str,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        self.name
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(LodestoneError::transient(self.name, "503 Service Unavailable"));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for w in words(t) {
                    v[fnv(&w) as usize % DIMS] += 1.0;
                }
                // Keep every vector non-zero so cosine is defined.
                v[0] += 0.01;
                v
            })
            .collect())
    }
}

/// Sparse encoder keyed on whole words.
pub struct KeywordSparse;

#[async_trait]
impl SparseEncoder for KeywordSparse {
    fn model_name(&self) -> &str {
        "keyword-sparse"
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut weights: BTreeMap<u32, f32> = BTreeMap::new();
                for w in words(t) {
                    *weights.entry(fnv(&w) % 30_000).or_default() += 1.0;
                }
                SparseVector::from_pairs(weights)
            })
            .collect())
    }
}

/// Sparse encoder whose service is always down.
pub struct DownSparse;

#[async_trait]
impl SparseEncoder for DownSparse {
    fn model_name(&self) -> &str {
        "down-sparse"
    }

    async fn encode(&self, _texts: &[String]) -> Result<Vec<SparseVector>> {
        Err(LodestoneError::transient("sparse", "connection refused"))
    }
}

/// Scores shorter texts higher.
pub struct ShortestFirst;

#[async_trait]
impl RerankProvider for ShortestFirst {
    fn model_name(&self) -> &str {
        "shortest-first"
    }

    async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
        Ok(texts.iter().map(|t| 1.0 / (1.0 + t.len() as f32)).collect())
    }
}

pub struct DownReranker;

#[async_trait]
impl RerankProvider for DownReranker {
    fn model_name(&self) -> &str {
        "down-reranker"
    }

    async fn score(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
        Err(LodestoneError::transient("rerank", "timed out"))
    }
}

pub struct Harness {
    pub catalog: Arc<dyn Catalog>,
    pub store: Arc<dyn Store>,
    pub text: Arc<KeywordEmbedder>,
    pub code: Arc<KeywordEmbedder>,
    pub router: EmbeddingRouter,
    pub chunking: ChunkerConfig,
}

impl Harness {
    pub fn in_memory(sparse: Option<Arc<dyn SparseEncoder>>) -> Self {
        Self::with_backends(Arc::new(InMemoryCatalog::new()), Arc::new(InMemoryStore::new()), sparse)
    }

    pub fn with_backends(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
        sparse: Option<Arc<dyn SparseEncoder>>,
    ) -> Self {
        let text = KeywordEmbedder::new("text-model");
        let code = KeywordEmbedder::new("code-model");
        let router = EmbeddingRouter::new(text.clone(), code.clone(), sparse, 4, 4);
        Self {
            catalog,
            store,
            text,
            code,
            router,
            chunking: ChunkerConfig {
                max_chars: 1000,
                overlap_chars: 100,
                code_threshold: 0.5,
            },
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.catalog.clone(),
            self.store.clone(),
            self.router.clone(),
            Chunker::new(self.chunking.clone()),
            IngestConfig::default(),
            4,
        )
    }

    pub async fn ingest(&self, request: &IngestRequest, input: IngestInput) -> JobReport {
        self.orchestrator()
            .run(request, input, &ProgressSink::disabled("test-job"))
            .await
    }
}

pub fn request(project: &str, dataset: &str, scope: Scope) -> IngestRequest {
    IngestRequest {
        project: project.to_string(),
        dataset: dataset.to_string(),
        scope,
        force: false,
        strict: false,
    }
}

pub fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// `n` numbered lines of `line`, newline terminated.
pub fn lines(n: usize, line: &str) -> String {
    (1..=n).map(|i| format!("{} {}\n", line, i)).collect()
}
