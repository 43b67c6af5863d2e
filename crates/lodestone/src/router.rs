//! Embedding router: sends each chunk to the text or code model, batches
//! the calls, and attaches sparse vectors when a sparse encoder is set.
//!
//! A process-wide [`Semaphore`] caps concurrent model calls at
//! `embedding.concurrency`, however many jobs share the router. Within a
//! batch the dense and sparse calls run concurrently; a sparse failure
//! degrades that batch to dense-only, a dense failure fails the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use lodestone_core::embedding::{EmbeddingProvider, ModelRole, SparseEncoder};
use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::{Chunk, SparseVector};

use crate::config::Config;
use crate::embedding::{create_provider, HttpSparseEncoder};

/// A chunk that could not be embedded.
#[derive(Debug, Clone)]
pub struct FailedChunk {
    pub id: String,
    pub error: LodestoneError,
}

#[derive(Debug, Default)]
pub struct EmbedOutcome {
    /// Chunks with `dense_vector` set, in input order.
    pub embedded: Vec<Chunk>,
    pub failed: Vec<FailedChunk>,
}

impl EmbedOutcome {
    fn fail_all(chunks: &[Chunk], error: &LodestoneError) -> Self {
        Self {
            embedded: Vec::new(),
            failed: chunks
                .iter()
                .map(|c| FailedChunk {
                    id: c.id.clone(),
                    error: error.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingRouter {
    text: Arc<dyn EmbeddingProvider>,
    code: Arc<dyn EmbeddingProvider>,
    sparse: Option<Arc<dyn SparseEncoder>>,
    batch_size: usize,
    limiter: Arc<Semaphore>,
}

impl EmbeddingRouter {
    pub fn new(
        text: Arc<dyn EmbeddingProvider>,
        code: Arc<dyn EmbeddingProvider>,
        sparse: Option<Arc<dyn SparseEncoder>>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            text,
            code,
            sparse,
            batch_size: batch_size.max(1),
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Build providers from `[embedding]` and `[sparse]`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedding = &config.embedding;
        let text = create_provider(&embedding.text, embedding)?;
        let code = match &embedding.code {
            Some(model) => create_provider(model, embedding)?,
            None => text.clone(),
        };
        let sparse: Option<Arc<dyn SparseEncoder>> = if config.sparse.enabled {
            Some(Arc::new(HttpSparseEncoder::new(
                &config.sparse,
                embedding.max_retries,
            )?))
        } else {
            None
        };
        Ok(Self::new(
            text,
            code,
            sparse,
            embedding.batch_size,
            embedding.concurrency,
        ))
    }

    pub fn provider(&self, role: ModelRole) -> &Arc<dyn EmbeddingProvider> {
        match role {
            ModelRole::Text => &self.text,
            ModelRole::Code => &self.code,
        }
    }

    pub fn has_sparse(&self) -> bool {
        self.sparse.is_some()
    }

    /// Embed `chunks`. Never fails as a whole: chunks whose batch failed
    /// are listed in [`EmbedOutcome::failed`].
    pub async fn embed(&self, chunks: Vec<Chunk>) -> EmbedOutcome {
        let mut by_role: BTreeMap<&'static str, (ModelRole, Vec<Chunk>)> = BTreeMap::new();
        for chunk in chunks {
            let role = ModelRole::route(chunk.is_code, chunk.language.as_deref());
            by_role
                .entry(role.as_str())
                .or_insert_with(|| (role, Vec::new()))
                .1
                .push(chunk);
        }

        let mut set = JoinSet::new();
        let mut pending: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut seq = 0usize;

        for (_, (role, group)) in by_role {
            for batch in group.chunks(self.batch_size) {
                let batch = batch.to_vec();
                pending.insert(seq, batch.iter().map(|c| c.id.clone()).collect());

                let provider = self.provider(role).clone();
                let sparse = self.sparse.clone();
                let limiter = self.limiter.clone();
                let index = seq;
                set.spawn(async move {
                    let _permit = limiter.acquire_owned().await;
                    (index, embed_batch(provider.as_ref(), sparse.as_deref(), batch).await)
                });
                seq += 1;
            }
        }

        let mut finished: BTreeMap<usize, EmbedOutcome> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    pending.remove(&index);
                    finished.insert(index, outcome);
                }
                Err(e) => tracing::error!(error = %e, "embedding task aborted"),
            }
        }

        let mut outcome = EmbedOutcome::default();
        for (_, batch) in finished {
            outcome.embedded.extend(batch.embedded);
            outcome.failed.extend(batch.failed);
        }
        for (_, ids) in pending {
            let error = LodestoneError::permanent("embedding", "embedding task aborted");
            outcome.failed.extend(ids.into_iter().map(|id| FailedChunk {
                id,
                error: error.clone(),
            }));
        }
        outcome
    }

    /// Embed a query with the text model, plus its sparse vector when a
    /// sparse encoder is configured. Sparse failure yields `None`.
    pub async fn embed_query(&self, text: &str) -> Result<(Vec<f32>, Option<SparseVector>)> {
        let texts = vec![text.to_string()];
        let (dense, sparse) = tokio::join!(self.text.embed(&texts), async {
            match &self.sparse {
                Some(encoder) => Some(encoder.encode(&texts).await),
                None => None,
            }
        });

        let dense = dense?
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LodestoneError::permanent("embedding", "empty query embedding"))?;

        let sparse = match sparse {
            Some(Ok(vectors)) => vectors.into_iter().next(),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "sparse query encoding failed; dense only");
                None
            }
            None => None,
        };
        Ok((dense, sparse))
    }
}

/// One provider call (plus optional sparse call) for one batch.
async fn embed_batch(
    provider: &dyn EmbeddingProvider,
    sparse: Option<&dyn SparseEncoder>,
    mut batch: Vec<Chunk>,
) -> EmbedOutcome {
    let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

    let (dense, sparse) = tokio::join!(provider.embed(&texts), async {
        match sparse {
            Some(encoder) => Some(encoder.encode(&texts).await),
            None => None,
        }
    });

    let vectors = match dense.and_then(|v| check_vectors(provider, v, batch.len())) {
        Ok(vectors) => vectors,
        Err(e) => {
            tracing::warn!(
                model = provider.model_name(),
                chunks = batch.len(),
                error = %e,
                "embedding batch failed"
            );
            return EmbedOutcome::fail_all(&batch, &e);
        }
    };

    let sparse_vectors = match sparse {
        Some(Ok(v)) if v.len() == batch.len() => Some(v),
        Some(Ok(v)) => {
            tracing::warn!(
                expected = batch.len(),
                got = v.len(),
                "sparse encoder returned wrong count; batch is dense only"
            );
            None
        }
        Some(Err(e)) => {
            tracing::warn!(error = %e, "sparse encoding failed; batch is dense only");
            None
        }
        None => None,
    };

    let model = provider.model_name().to_string();
    match sparse_vectors {
        Some(sparse_vectors) => {
            for ((chunk, dense), sparse) in batch.iter_mut().zip(vectors).zip(sparse_vectors) {
                chunk.dense_vector = dense;
                chunk.sparse_vector = Some(sparse);
                chunk.embedding_model = model.clone();
            }
        }
        None => {
            for (chunk, dense) in batch.iter_mut().zip(vectors) {
                chunk.dense_vector = dense;
                chunk.sparse_vector = None;
                chunk.embedding_model = model.clone();
            }
        }
    }

    EmbedOutcome {
        embedded: batch,
        failed: Vec::new(),
    }
}

fn check_vectors(
    provider: &dyn EmbeddingProvider,
    vectors: Vec<Vec<f32>>,
    expected: usize,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(LodestoneError::permanent(
            provider.model_name(),
            format!("expected {} embeddings, got {}", expected, vectors.len()),
        ));
    }
    let dims = provider.dims();
    for v in &vectors {
        if v.is_empty() || (dims > 0 && v.len() != dims) {
            return Err(LodestoneError::permanent(
                provider.model_name(),
                format!("dimension mismatch: expected {}, got {}", dims, v.len()),
            ));
        }
    }
    Ok(vectors)
}
