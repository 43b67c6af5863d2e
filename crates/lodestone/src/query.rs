//! Hybrid query engine.
//!
//! 1. Resolve the datasets the request may read (scope lattice).
//! 2. Embed the query densely and sparsely in parallel.
//! 3. Search every collection holding an accessible dataset, with bounded
//!    concurrency, restricting each search to the accessible dataset ids.
//! 4. Pool the candidates and re-fuse them with RRF over the union.
//! 5. Optionally rerank an expanded pool, then truncate to `top_k`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use lodestone_core::error::{LodestoneError, Result};
use lodestone_core::models::Position;
use lodestone_core::rerank::{rerank, RerankProvider};
use lodestone_core::scope::{accessible_datasets, Catalog, ScopeFilter};
use lodestone_core::search::{merge_collections, SearchHit};
use lodestone_core::store::{SearchFilter, Store, StoreQuery};

use crate::config::{Config, RetrievalConfig};
use crate::rerank::create_reranker;
use crate::router::EmbeddingRouter;

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub project: String,
    pub scope: ScopeFilter,
    /// Defaults to `retrieval.top_k`.
    pub top_k: Option<usize>,
    /// Defaults to `retrieval.include_global`.
    pub include_global: Option<bool>,
    /// Extra AND-conditions. `dataset_ids` is always overwritten with the
    /// accessible set.
    pub filter: SearchFilter,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            project: project.into(),
            scope: ScopeFilter::Project,
            top_k: None,
            include_global: None,
            filter: SearchFilter::default(),
        }
    }
}

pub struct QueryEngine {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn Store>,
    router: EmbeddingRouter,
    reranker: Option<Arc<dyn RerankProvider>>,
    retrieval: RetrievalConfig,
    rerank_pool: usize,
    rerank_max_chars: usize,
}

impl QueryEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
        router: EmbeddingRouter,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            router,
            reranker: None,
            retrieval,
            rerank_pool: 0,
            rerank_max_chars: lodestone_core::rerank::DEFAULT_RERANK_MAX_CHARS,
        }
    }

    /// Enable reranking over the best `pool` fused candidates.
    pub fn with_reranker(mut self, reranker: Arc<dyn RerankProvider>, pool: usize, max_chars: usize) -> Self {
        self.reranker = Some(reranker);
        self.rerank_pool = pool;
        self.rerank_max_chars = max_chars;
        self
    }

    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<Self> {
        let router = EmbeddingRouter::from_config(config)?;
        let engine = Self::new(catalog, store, router, config.retrieval.clone());
        Ok(
            match create_reranker(&config.rerank, config.embedding.max_retries)? {
                Some(reranker) => {
                    engine.with_reranker(reranker, config.rerank.pool, config.rerank.max_chars)
                }
                None => engine,
            },
        )
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<Vec<SearchHit>> {
        let top_k = request.top_k.unwrap_or(self.retrieval.top_k).max(1);
        let include_global = request.include_global.unwrap_or(self.retrieval.include_global);

        let datasets = accessible_datasets(
            self.catalog.as_ref(),
            &request.project,
            &request.scope,
            include_global,
        )
        .await?;
        if datasets.is_empty() {
            return Err(LodestoneError::NoAccessibleData {
                project: request.project.clone(),
            });
        }

        let mut by_collection: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for d in &datasets {
            by_collection
                .entry(d.collection.clone())
                .or_default()
                .insert(d.dataset_id.clone());
        }

        let (dense, sparse) = self.router.embed_query(&request.text).await.map_err(|e| {
            LodestoneError::ServiceUnavailable(format!("query embedding failed: {}", e))
        })?;

        let pool = match &self.reranker {
            Some(_) => self.rerank_pool.max(top_k),
            None => top_k,
        };
        let per_collection = self.retrieval.candidate_k.max(pool);

        tracing::debug!(
            project = %request.project,
            collections = by_collection.len(),
            datasets = datasets.len(),
            sparse = sparse.is_some(),
            "searching"
        );

        let limiter = Arc::new(Semaphore::new(self.retrieval.collection_concurrency.max(1)));
        let mut set = JoinSet::new();
        for (collection, dataset_ids) in by_collection {
            let store = self.store.clone();
            let limiter = limiter.clone();
            let query = StoreQuery {
                dense: dense.clone(),
                sparse: sparse.clone(),
                filter: SearchFilter {
                    dataset_ids: Some(dataset_ids),
                    ..request.filter.clone()
                },
                top_k: per_collection,
                rrf_k: self.retrieval.rrf_k,
            };
            set.spawn(async move {
                let _permit = limiter.acquire_owned().await;
                store.search(&collection, &query).await
            });
        }

        let mut lists = Vec::new();
        while let Some(joined) = set.join_next().await {
            let candidates = joined.map_err(LodestoneError::storage)??;
            lists.push(candidates);
        }

        let hits = merge_collections(lists, self.retrieval.rrf_k, pool);

        match &self.reranker {
            Some(reranker) => {
                Ok(rerank(reranker.as_ref(), &request.text, hits, top_k, self.rerank_max_chars).await)
            }
            None => Ok(hits),
        }
    }
}

/// Entry point for `lode search`.
pub async fn run_search(config: &Config, request: &QueryRequest, json: bool) -> anyhow::Result<()> {
    let backends = crate::db::open(config).await?;
    let engine = QueryEngine::from_config(config, backends.catalog.clone(), backends.store.clone())?;
    let hits = engine.query(request).await;
    backends.pool.close().await;
    let hits = hits?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let span = match hit.position {
            Position::Lines {
                start_line,
                end_line,
            } => format!("L{}-{}", start_line, end_line),
            Position::Offsets { start, end } => format!("@{}..{}", start, end),
        };
        println!("{}. [{:.4}] {} {}", i + 1, hit.score, hit.source_key, span);
        println!(
            "    dataset: {} ({}){}",
            hit.dataset_id,
            hit.scope,
            hit.language
                .as_deref()
                .map(|l| format!("  language: {}", l))
                .unwrap_or_default()
        );
        println!(
            "    scores: dense {} / sparse {} / fused {:.4}{}",
            fmt_signal(hit.scores.dense_score, hit.scores.dense_rank),
            fmt_signal(hit.scores.sparse_score, hit.scores.sparse_rank),
            hit.scores.fused_score,
            hit.scores
                .rerank_score
                .map(|s| format!(" / rerank {:.3}", s))
                .unwrap_or_default()
        );
        let excerpt: String = hit.content.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    id: {}", hit.id);
        println!();
    }
    Ok(())
}

fn fmt_signal(score: Option<f32>, rank: Option<usize>) -> String {
    match (score, rank) {
        (Some(score), Some(rank)) => format!("{:.3} (#{})", score, rank),
        (Some(score), None) => format!("{:.3}", score),
        _ => "-".to_string(),
    }
}
