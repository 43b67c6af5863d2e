//! SQLite catalog and store: persistence, slot replacement, dims, and the
//! full pipeline against a real database file.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{lines, request, write, Harness, KeywordSparse};
use lodestone::config::{parse_config, Config};
use lodestone::datasets::list_datasets;
use lodestone::db;
use lodestone::ingest::IngestInput;
use lodestone::progress::JobState;
use lodestone::query::{QueryEngine, QueryRequest};
use lodestone_core::error::LodestoneError;
use lodestone_core::fusion::DEFAULT_RRF_K;
use lodestone_core::models::{Chunk, Position, Provenance, Scope, SparseVector};
use lodestone_core::store::{SearchFilter, StoreQuery};
use tempfile::TempDir;

fn config(tmp: &TempDir) -> Config {
    parse_config(&format!(
        "[db]\npath = \"{}\"\n",
        tmp.path().join("data/lodestone.sqlite").display()
    ))
    .unwrap()
}

fn chunk(id: &str, source: &str, start_line: u32, dims: usize) -> Chunk {
    let mut provenance = Provenance::new();
    provenance.insert("repo".to_string(), "demo".to_string());
    Chunk {
        id: id.to_string(),
        project_id: "p1".to_string(),
        dataset_id: "d1".to_string(),
        scope: Scope::Project,
        source_key: source.to_string(),
        content: format!("content of {}", id),
        content_hash: format!("hash-{}", id),
        summary: None,
        position: Position::Lines {
            start_line,
            end_line: start_line + 4,
        },
        part: 0,
        is_code: true,
        language: Some("rust".to_string()),
        code_confidence: 0.9,
        dense_vector: vec![1.0; dims],
        sparse_vector: Some(SparseVector::from_pairs([(7, 1.5), (3, 0.5)])),
        embedding_model: "test-model".to_string(),
        provenance,
        indexed_at: 1_700_000_000,
    }
}

fn query(dims: usize) -> StoreQuery {
    StoreQuery {
        dense: vec![1.0; dims],
        sparse: Some(SparseVector::from_pairs([(7, 1.0)])),
        filter: SearchFilter::default(),
        top_k: 10,
        rrf_k: DEFAULT_RRF_K,
    }
}

#[tokio::test]
async fn test_store_round_trips_chunks() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let store = backends.store.clone();

    let report = store
        .upsert("c1", &[chunk("a", "src/lib.rs", 1, 4), chunk("b", "src/lib.rs", 6, 4)])
        .await
        .unwrap();
    assert_eq!((report.inserted, report.updated), (2, 0));

    let hits = store.search("c1", &query(4)).await.unwrap();
    assert_eq!(hits.len(), 2);
    let a = hits.iter().find(|c| c.chunk.id == "a").unwrap();
    assert_eq!(a.collection, "c1");
    assert_eq!(a.chunk.position, Position::Lines { start_line: 1, end_line: 5 });
    assert_eq!(a.chunk.language.as_deref(), Some("rust"));
    assert_eq!(a.chunk.provenance.get("repo").map(String::as_str), Some("demo"));
    assert_eq!(a.sparse_score, Some(1.5));
    // Hits carry no vectors.
    assert!(a.chunk.dense_vector.is_empty());

    assert!(store.search("other", &query(4)).await.unwrap().is_empty());
    assert_eq!(store.collections().await.unwrap(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn test_store_replaces_slot_and_counts_update() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let store = backends.store.clone();

    store.upsert("c1", &[chunk("old", "src/lib.rs", 1, 4)]).await.unwrap();
    let report = store.upsert("c1", &[chunk("new", "src/lib.rs", 1, 4)]).await.unwrap();
    assert_eq!((report.inserted, report.updated), (0, 1));
    assert_eq!(store.count("c1", None).await.unwrap(), 1);
    assert_eq!(
        store.existing_ids("c1", "d1", "src/lib.rs").await.unwrap(),
        BTreeSet::from(["new".to_string()])
    );

    let again = store.upsert("c1", &[chunk("new", "src/lib.rs", 1, 4)]).await.unwrap();
    assert_eq!((again.inserted, again.updated), (0, 1));
}

#[tokio::test]
async fn test_store_keeps_parts_of_one_line() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let store = backends.store.clone();

    let parts: Vec<Chunk> = (0..3)
        .map(|part| {
            let mut c = chunk(&format!("part-{}", part), "min.js", 1, 4);
            c.part = part;
            c
        })
        .collect();
    let report = store.upsert("c1", &parts).await.unwrap();
    assert_eq!((report.inserted, report.updated), (3, 0));
    assert_eq!(store.count("c1", None).await.unwrap(), 3);

    let hits = store.search("c1", &query(4)).await.unwrap();
    let mut stored: Vec<u32> = hits.iter().map(|h| h.chunk.part).collect();
    stored.sort();
    assert_eq!(stored, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_store_rejects_dimension_change() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let store = backends.store.clone();

    store.upsert("c1", &[chunk("a", "a.rs", 1, 4)]).await.unwrap();
    let err = store.upsert("c2", &[chunk("b", "b.rs", 1, 8)]).await.unwrap_err();
    assert!(matches!(err, LodestoneError::Storage(_)), "{:?}", err);
    assert_eq!(store.count("c2", None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_prune_keeps_listed_ids_of_one_source() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let store = backends.store.clone();

    store
        .upsert(
            "c1",
            &[
                chunk("a", "a.rs", 1, 4),
                chunk("b", "a.rs", 6, 4),
                chunk("c", "c.rs", 1, 4),
            ],
        )
        .await
        .unwrap();
    let pruned = store
        .prune("c1", "d1", "a.rs", &BTreeSet::from(["a".to_string()]))
        .await
        .unwrap();
    assert_eq!(pruned, 1);
    assert_eq!(store.count("c1", None).await.unwrap(), 2);
    assert_eq!(store.count("c1", Some("d1")).await.unwrap(), 2);
    assert_eq!(store.count("c1", Some("nope")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_catalog_get_or_create_converges() {
    let tmp = TempDir::new().unwrap();
    let backends = db::open(&config(&tmp)).await.unwrap();
    let catalog = backends.catalog.clone();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let catalog = catalog.clone();
        tasks.spawn(async move {
            lodestone_core::scope::resolve(catalog.as_ref(), "acme", "docs", Scope::Dataset, false)
                .await
                .unwrap()
        });
    }
    let mut targets = BTreeSet::new();
    while let Some(target) = tasks.join_next().await {
        targets.insert(target.unwrap().dataset_id);
    }
    assert_eq!(targets.len(), 1);
    assert_eq!(catalog.list_projects().await.unwrap().len(), 1);

    let err = lodestone_core::scope::resolve(catalog.as_ref(), "acme", "docs", Scope::Global, false)
        .await
        .unwrap_err();
    assert!(matches!(err, LodestoneError::ScopeResolution(_)));
    assert!(catalog.set_active("missing", false).await.is_err());
}

#[tokio::test]
async fn test_pipeline_persists_across_reopen() {
    let tmp = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    write(repo.path(), "src/lib.rs", &lines(12, "// cache layer"));
    write(repo.path(), "README.md", &lines(8, "Cache layer overview"));
    let cfg = config(&tmp);
    let req = request("acme", "core", Scope::Project);
    let input = IngestInput::Repository(repo.path().to_path_buf());

    let first = {
        let backends = db::open(&cfg).await.unwrap();
        let harness = Harness::with_backends(
            backends.catalog.clone(),
            backends.store.clone(),
            Some(Arc::new(KeywordSparse)),
        );
        let report = harness.ingest(&req, input.clone()).await;
        backends.pool.close().await;
        report
    };
    assert_eq!(first.state, JobState::Completed, "{:?}", first.error);
    assert_eq!(first.inserted, 2);

    let backends = db::open(&cfg).await.unwrap();
    let harness = Harness::with_backends(
        backends.catalog.clone(),
        backends.store.clone(),
        Some(Arc::new(KeywordSparse)),
    );
    let second = harness.ingest(&req, input).await;
    assert_eq!(second.skipped_unchanged, 2);
    assert_eq!(second.attempted, 0);
    assert_eq!(harness.text.texts_embedded() + harness.code.texts_embedded(), 0);

    let engine = QueryEngine::new(
        harness.catalog.clone(),
        harness.store.clone(),
        harness.router.clone(),
        lodestone::config::RetrievalConfig::default(),
    );
    let hits = engine.query(&QueryRequest::new("cache layer", "acme")).await.unwrap();
    assert_eq!(hits.len(), 2);

    let rows = list_datasets(backends.catalog.as_ref(), backends.store.as_ref())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].project, "acme");
    assert_eq!(rows[0].chunks, 2);
}
