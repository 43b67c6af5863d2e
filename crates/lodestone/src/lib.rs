//! # Lodestone
//!
//! Ingests source repositories and crawled web pages into scoped vector
//! collections and serves hybrid (dense + sparse) retrieval over them.
//!
//! ```text
//! ┌────────────┐   ┌─────────┐   ┌───────────┐   ┌────────┐   ┌────────┐
//! │ scan (repo │──▶│ chunker │──▶│ normalize │──▶│ router │──▶│ store  │
//! │ or pages)  │   │         │   │ (ids)     │   │ dense+ │   │ SQLite │
//! └────────────┘   └─────────┘   └───────────┘   │ sparse │   └───┬────┘
//!                                                └────────┘       │
//!                      query ─▶ scope lattice ─▶ per-collection ──┘
//!                               search ─▶ global RRF ─▶ rerank
//! ```
//!
//! Pure logic (chunking, identity, scopes, fusion, the store and catalog
//! traits) lives in `lodestone-core`. This crate adds configuration,
//! SQLite persistence, HTTP model clients, the embedding router, the
//! ingestion orchestrator, the query engine, and the `lode` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`], [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`], [`catalog`] | SQLite `Store` and `Catalog` |
//! | [`embedding`] | Dense providers and the sparse encoder client |
//! | [`rerank`] | Cross-encoder client |
//! | [`router`] | Routes chunks to the text or code model, bounded batching |
//! | [`scan`] | Repository walking and crawled-page loading |
//! | [`ingest`] | Ingestion jobs |
//! | [`query`] | Hybrid query engine |
//! | [`progress`] | Job progress channel and reporters |
//! | [`datasets`], [`chunk_cmd`] | `lode datasets` and `lode chunk` |

pub mod catalog;
pub mod chunk_cmd;
pub mod config;
pub mod datasets;
pub mod db;
pub mod embedding;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod query;
pub mod rerank;
pub mod router;
pub mod scan;
pub mod sqlite_store;
