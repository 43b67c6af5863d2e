//! Embedding traits, model routing, and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait for dense models and the
//! [`SparseEncoder`] trait for lexical sparse vectors, plus the pure
//! [`ModelRole::route`] function that decides which dense model embeds a
//! chunk.
//!
//! Concrete providers (OpenAI, Ollama, fastembed, HTTP sparse encoder) and
//! the batching router live in the `lodestone` app crate.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::SparseVector;

/// Dense embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts. The output has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Sparse lexical encoder (SPLADE-style index → weight vectors).
#[async_trait]
pub trait SparseEncoder: Send + Sync {
    fn model_name(&self) -> &str;
    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>>;
}

/// Which dense model a chunk is embedded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    Text,
    Code,
}

impl ModelRole {
    /// Code goes to the code model, everything else to the text model.
    ///
    /// `language` alone never makes a chunk code: a Markdown file is prose
    /// even though it has a language tag.
    pub fn route(is_code: bool, _language: Option<&str>) -> Self {
        if is_code {
            ModelRole::Code
        } else {
            ModelRole::Text
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Text => "text",
            ModelRole::Code => "code",
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use lodestone_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
