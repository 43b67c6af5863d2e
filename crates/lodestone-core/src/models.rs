//! Core data models used throughout Lodestone.
//!
//! [`Chunk`] is the canonical record: every ingestion source is mapped onto
//! it by [`identity::normalize`](crate::identity::normalize), and the store
//! and query engine only ever see this shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::LodestoneError;

/// Visibility tier of a dataset.
///
/// - `Global`: visible to every project.
/// - `Project`: visible to every request scoped to the owning project.
/// - `Dataset` (alias `local`): visible only to requests naming the dataset,
///   or the owning project as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Project,
    #[serde(alias = "local")]
    Dataset,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Project => "project",
            Scope::Dataset => "dataset",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = LodestoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Scope::Global),
            "project" => Ok(Scope::Project),
            "dataset" | "local" => Ok(Scope::Dataset),
            other => Err(LodestoneError::ScopeResolution(format!(
                "unknown scope '{}'. Use global, project, or dataset (local)",
                other
            ))),
        }
    }
}

/// Logical tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// Named partition owned by exactly one [`Project`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub scope: Scope,
    pub active: bool,
    /// Physical collection this dataset writes to.
    pub collection: String,
    pub created_at: i64,
}

/// Which coordinate system a [`Position`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    Lines,
    Offsets,
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionKind::Lines => "lines",
            PositionKind::Offsets => "offsets",
        }
    }
}

impl FromStr for PositionKind {
    type Err = LodestoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lines" => Ok(PositionKind::Lines),
            "offsets" => Ok(PositionKind::Offsets),
            other => Err(LodestoneError::storage(format!(
                "unknown position kind '{}'",
                other
            ))),
        }
    }
}

/// Span of a chunk inside its source.
///
/// Line spans are 1-based and inclusive; offset spans are byte offsets,
/// half-open. Converting between the two needs the original text, see
/// [`LineIndex`](crate::identity::LineIndex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    Lines { start_line: u32, end_line: u32 },
    Offsets { start: u64, end: u64 },
}

impl Position {
    pub fn kind(&self) -> PositionKind {
        match self {
            Position::Lines { .. } => PositionKind::Lines,
            Position::Offsets { .. } => PositionKind::Offsets,
        }
    }

    pub fn start(&self) -> u64 {
        match self {
            Position::Lines { start_line, .. } => *start_line as u64,
            Position::Offsets { start, .. } => *start,
        }
    }

    pub fn end(&self) -> u64 {
        match self {
            Position::Lines { end_line, .. } => *end_line as u64,
            Position::Offsets { end, .. } => *end,
        }
    }

    /// Stable textual key for the span start, tagged with its coordinate
    /// system so `L12` and `O12` never collide.
    pub fn start_key(&self) -> String {
        match self {
            Position::Lines { start_line, .. } => format!("L{}", start_line),
            Position::Offsets { start, .. } => format!("O{}", start),
        }
    }

    /// Rebuild a position from its stored parts.
    pub fn from_parts(kind: PositionKind, start: u64, end: u64) -> Self {
        match kind {
            PositionKind::Lines => Position::Lines {
                start_line: start as u32,
                end_line: end as u32,
            },
            PositionKind::Offsets => Position::Offsets { start, end },
        }
    }
}

/// Sparse lexical vector: parallel `indices` / `values`, sorted by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Build from unordered pairs. Duplicate indices are summed.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, f32)>) -> Self {
        let mut merged: BTreeMap<u32, f32> = BTreeMap::new();
        for (index, value) in pairs {
            *merged.entry(index).or_insert(0.0) += value;
        }
        let (indices, values) = merged.into_iter().unzip();
        Self { indices, values }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Dot product over the indices both vectors share.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j) = (0, 0);
        let mut sum = 0.0f32;
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    sum += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        sum
    }
}

/// Open key-value provenance (`repo`, `branch`, `commit`, `path`, `url`, ...).
pub type Provenance = BTreeMap<String, String>;

/// Code/prose classification attached to every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeClass {
    pub is_code: bool,
    pub language: Option<String>,
    /// Heuristic confidence in `[0.0, 1.0]` that the text is code.
    pub confidence: f32,
}

impl CodeClass {
    pub fn prose() -> Self {
        Self {
            is_code: false,
            language: None,
            confidence: 0.0,
        }
    }
}

/// The canonical chunk record, identical for every ingestion source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic UUID, see [`identity::chunk_id`](crate::identity::chunk_id).
    pub id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub scope: Scope,
    /// Normalized repository path or page URL.
    pub source_key: String,
    pub content: String,
    /// SHA-256 of `content`, hex encoded.
    pub content_hash: String,
    pub summary: Option<String>,
    pub position: Position,
    /// Index among this source's chunks that start at the same position.
    /// Non-zero only when one line is split into several chunks.
    #[serde(default)]
    pub part: u32,
    pub is_code: bool,
    pub language: Option<String>,
    pub code_confidence: f32,
    pub dense_vector: Vec<f32>,
    pub sparse_vector: Option<SparseVector>,
    /// Model that produced `dense_vector`. Empty until embedded.
    pub embedding_model: String,
    pub provenance: Provenance,
    pub indexed_at: i64,
}

impl Chunk {
    /// Copy without vectors, for returning hits to callers.
    pub fn without_vectors(&self) -> Chunk {
        Chunk {
            dense_vector: Vec::new(),
            sparse_vector: None,
            ..self.clone()
        }
    }

    pub fn is_embedded(&self) -> bool {
        !self.dense_vector.is_empty()
    }
}

/// A chunk as produced by a repository checkout: line-based coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryChunk {
    pub repo: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub path: String,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    /// See [`Chunk::part`].
    pub part: u32,
    pub class: CodeClass,
    pub summary: Option<String>,
}

/// A chunk of a crawled page's markdown: byte-offset coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PageChunk {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
    pub start_offset: u64,
    pub end_offset: u64,
    pub class: CodeClass,
    pub summary: Option<String>,
}

/// Closed set of ingestion source shapes, consumed only by the normalizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Repository(RepositoryChunk),
    CrawledPage(PageChunk),
}

impl SourceRecord {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SourceRecord::Repository(_) => "repository",
            SourceRecord::CrawledPage(_) => "crawled_page",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse_aliases() {
        assert_eq!("local".parse::<Scope>().unwrap(), Scope::Dataset);
        assert_eq!("Dataset".parse::<Scope>().unwrap(), Scope::Dataset);
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::Global);
        assert!("team".parse::<Scope>().is_err());
    }

    #[test]
    fn test_sparse_from_pairs_sorts_and_merges() {
        let v = SparseVector::from_pairs([(7, 1.0), (2, 0.5), (7, 0.5)]);
        assert_eq!(v.indices, vec![2, 7]);
        assert_eq!(v.values, vec![0.5, 1.5]);
    }

    #[test]
    fn test_sparse_dot_only_shared_indices() {
        let a = SparseVector::from_pairs([(1, 2.0), (3, 1.0), (9, 4.0)]);
        let b = SparseVector::from_pairs([(3, 3.0), (9, 0.5), (10, 8.0)]);
        assert!((a.dot(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.dot(&SparseVector::default()), 0.0);
    }

    #[test]
    fn test_position_start_key_tags_coordinate_system() {
        let lines = Position::Lines {
            start_line: 12,
            end_line: 20,
        };
        let offsets = Position::Offsets { start: 12, end: 99 };
        assert_eq!(lines.start_key(), "L12");
        assert_eq!(offsets.start_key(), "O12");
        assert_eq!(
            Position::from_parts(offsets.kind(), offsets.start(), offsets.end()),
            offsets
        );
    }

    #[test]
    fn test_position_serde_is_tagged() {
        let json = serde_json::to_value(Position::Lines {
            start_line: 1,
            end_line: 3,
        })
        .unwrap();
        assert_eq!(json["kind"], "lines");
        assert_eq!(json["start_line"], 1);
    }
}
