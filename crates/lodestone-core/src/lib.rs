//! # Lodestone Core
//!
//! Runtime-agnostic logic for Lodestone: data models, chunking, chunk
//! identity, scope resolution, rank fusion, the store and catalog
//! abstractions (with in-memory implementations), and the embedding and
//! rerank traits.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! `lodestone` app crate supplies the model clients, SQLite backends, and
//! the ingestion and query pipelines built on these pieces.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod identity;
pub mod models;
pub mod rerank;
pub mod scope;
pub mod search;
pub mod store;

pub use error::{LodestoneError, Result};
