//! In-memory [`Store`] implementation for tests and embedding into other
//! applications.
//!
//! Collections are `HashMap`s behind one `std::sync::RwLock`. Search is
//! brute force over the collection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{LodestoneError, Result};
use crate::models::Chunk;

use super::{check_dims, rank_collection, Candidate, SlotKey, Store, StoreQuery, UpsertReport};

/// Chunks are keyed by `(dataset_id, id)`: the same content indexed into
/// two datasets sharing a collection stays two records.
#[derive(Default)]
struct Collection {
    chunks: BTreeMap<(String, String), Chunk>,
    slots: HashMap<SlotKey, String>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    dims: Option<usize>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> LodestoneError {
    LodestoneError::storage("store lock poisoned")
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(&self, collection: &str, chunks: &[Chunk]) -> Result<UpsertReport> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.dims = check_dims(inner.dims, chunks)?;

        let coll = inner.collections.entry(collection.to_string()).or_default();
        let mut report = UpsertReport::default();
        for chunk in chunks {
            let slot = SlotKey::of(chunk);
            let key = (chunk.dataset_id.clone(), chunk.id.clone());
            if coll.chunks.contains_key(&key) {
                report.updated += 1;
            } else if let Some(previous) = coll.slots.get(&slot) {
                coll.chunks.remove(&(chunk.dataset_id.clone(), previous.clone()));
                report.updated += 1;
            } else {
                report.inserted += 1;
            }
            coll.slots.insert(slot, chunk.id.clone());
            coll.chunks.insert(key, chunk.clone());
        }
        Ok(report)
    }

    async fn search(&self, collection: &str, query: &StoreQuery) -> Result<Vec<Candidate>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(match inner.collections.get(collection) {
            Some(coll) => rank_collection(collection, coll.chunks.values(), query),
            None => Vec::new(),
        })
    }

    async fn existing_ids(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
    ) -> Result<BTreeSet<String>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .collections
            .get(collection)
            .map(|coll| {
                coll.chunks
                    .values()
                    .filter(|c| c.dataset_id == dataset_id && c.source_key == source_key)
                    .map(|c| c.id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune(
        &self,
        collection: &str,
        dataset_id: &str,
        source_key: &str,
        keep: &BTreeSet<String>,
    ) -> Result<usize> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let Some(coll) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let stale: Vec<(String, String)> = coll
            .chunks
            .iter()
            .filter(|(_, c)| {
                c.dataset_id == dataset_id && c.source_key == source_key && !keep.contains(&c.id)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            coll.chunks.remove(key);
        }
        let chunks = &coll.chunks;
        coll.slots
            .retain(|slot, id| chunks.contains_key(&(slot.dataset_id.clone(), id.clone())));
        Ok(stale.len())
    }

    async fn count(&self, collection: &str, dataset_id: Option<&str>) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .collections
            .get(collection)
            .map(|coll| {
                coll.chunks
                    .values()
                    .filter(|c| dataset_id.map_or(true, |d| c.dataset_id == d))
                    .count()
            })
            .unwrap_or(0))
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut names: Vec<String> = inner
            .collections
            .iter()
            .filter(|(_, coll)| !coll.chunks.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::DEFAULT_RRF_K;
    use crate::models::Position;
    use crate::store::tests::chunk;
    use crate::store::SearchFilter;

    fn at_line(mut c: Chunk, source: &str, line: u32) -> Chunk {
        c.source_key = source.to_string();
        c.position = Position::Lines {
            start_line: line,
            end_line: line + 5,
        };
        c
    }

    #[tokio::test]
    async fn test_upsert_insert_then_update() {
        let store = InMemoryStore::new();
        let a = chunk("a", "d", vec![1.0, 0.0]);
        let report = store.upsert("c1", &[a.clone()]).await.unwrap();
        assert_eq!(report, UpsertReport { inserted: 1, updated: 0 });
        let report = store.upsert("c1", &[a]).await.unwrap();
        assert_eq!(report, UpsertReport { inserted: 0, updated: 1 });
        assert_eq!(store.count("c1", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_id_in_same_slot_replaces() {
        let store = InMemoryStore::new();
        let old = at_line(chunk("old", "d", vec![1.0, 0.0]), "src/lib.rs", 1);
        let new = at_line(chunk("new", "d", vec![0.0, 1.0]), "src/lib.rs", 1);
        store.upsert("c1", &[old]).await.unwrap();
        let report = store.upsert("c1", &[new]).await.unwrap();
        assert_eq!(report, UpsertReport { inserted: 0, updated: 1 });
        let ids = store.existing_ids("c1", "d", "src/lib.rs").await.unwrap();
        assert_eq!(ids, BTreeSet::from(["new".to_string()]));
    }

    #[tokio::test]
    async fn test_parts_of_one_line_keep_separate_slots() {
        let store = InMemoryStore::new();
        let parts: Vec<Chunk> = (0..3)
            .map(|part| {
                let mut c = at_line(chunk(&format!("p{}", part), "d", vec![1.0, 0.0]), "min.js", 1);
                c.part = part;
                c
            })
            .collect();
        let report = store.upsert("c1", &parts).await.unwrap();
        assert_eq!(report, UpsertReport { inserted: 3, updated: 0 });
        assert_eq!(store.count("c1", None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = InMemoryStore::new();
        store
            .upsert("c1", &[chunk("a", "d", vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = store
            .upsert("c2", &[chunk("b", "d", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, LodestoneError::Storage(_)));
        assert!(store.collections().await.unwrap() == vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_removes_stale_chunks_of_one_source() {
        let store = InMemoryStore::new();
        let keep = at_line(chunk("keep", "d", vec![1.0, 0.0]), "a.md", 1);
        let stale = at_line(chunk("stale", "d", vec![1.0, 0.0]), "a.md", 10);
        let other = at_line(chunk("other", "d", vec![1.0, 0.0]), "b.md", 10);
        store.upsert("c1", &[keep, stale, other]).await.unwrap();

        let removed = store
            .prune("c1", "d", "a.md", &BTreeSet::from(["keep".to_string()]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count("c1", Some("d")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_unknown_collection_is_empty() {
        let store = InMemoryStore::new();
        let hits = store
            .search(
                "missing",
                &StoreQuery {
                    dense: vec![1.0],
                    sparse: None,
                    filter: SearchFilter::default(),
                    top_k: 5,
                    rrf_k: DEFAULT_RRF_K,
                },
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_search_tags_collection() {
        let store = InMemoryStore::new();
        store
            .upsert("c1", &[chunk("a", "d", vec![1.0, 0.0])])
            .await
            .unwrap();
        let hits = store
            .search(
                "c1",
                &StoreQuery {
                    dense: vec![1.0, 0.0],
                    sparse: None,
                    filter: SearchFilter::default(),
                    top_k: 5,
                    rrf_k: DEFAULT_RRF_K,
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].collection, "c1");
        assert_eq!(hits[0].dense_rank, Some(1));
    }
}
