//! Chunk identity and source-record normalization.
//!
//! This is the one place that decides what a chunk record looks like. Both
//! ingestion sources arrive as a [`SourceRecord`] and leave as a canonical
//! [`Chunk`]; nothing downstream branches on where a chunk came from.
//!
//! # Identity
//!
//! ```text
//! id = uuid_v5(NAMESPACE_URL, source_key ␟ start_key[.part] ␟ sha256(content))
//! ```
//!
//! Identical inputs always produce the identical id, so re-ingesting an
//! unchanged document is an upsert, and two jobs indexing the same document
//! concurrently write the same rows.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{LodestoneError, Result};
use crate::models::{Chunk, Position, Provenance, SourceRecord};
use crate::scope::ResolvedTarget;

/// SHA-256 of the chunk text, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id from its normalized source, span start, part,
/// and text. Part 0 leaves the start key untagged.
pub fn chunk_id(source_key: &str, position: &Position, part: u32, content: &str) -> String {
    let start = match part {
        0 => position.start_key(),
        n => format!("{}.{}", position.start_key(), n),
    };
    let name = format!(
        "{}\u{1f}{}\u{1f}{}",
        source_key,
        start,
        content_hash(content)
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Normalize a repository-relative path: `/` separators, no leading `./`,
/// no duplicate slashes.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let parts: Vec<&str> = unified
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    parts.join("/")
}

/// Normalize a page URL: lowercase scheme and host, drop the fragment,
/// drop a trailing slash on non-root paths.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url = url::Url::parse(raw.trim()).map_err(|e| LodestoneError::SchemaMismatch {
        record_kind: "crawled_page",
        message: format!("invalid url '{}': {}", raw, e),
    })?;
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    Ok(url.to_string())
}

/// Byte offset ↔ line number conversion over a retained original text.
///
/// Positions from different sources use different coordinate systems;
/// converting between them requires the text they were cut from, so the
/// caller must hold on to it and build an index explicitly.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offset where each line starts. `starts[0] == 0`.
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' && i + 1 < text.len() {
                starts.push(i + 1);
            }
        }
        Self {
            starts,
            len: text.len(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 1-based line containing `offset` (clamped to the text).
    pub fn line_of(&self, offset: usize) -> u32 {
        let offset = offset.min(self.len);
        match self.starts.binary_search(&offset) {
            Ok(i) => (i + 1) as u32,
            Err(i) => i as u32,
        }
    }

    /// Byte offset of the first byte of 1-based `line`.
    pub fn line_start(&self, line: u32) -> Option<usize> {
        if line == 0 {
            return None;
        }
        self.starts.get(line as usize - 1).copied()
    }

    /// Byte offset just past 1-based `line`, including its newline.
    pub fn line_end(&self, line: u32) -> Option<usize> {
        if line == 0 || line as usize > self.starts.len() {
            return None;
        }
        Some(self.starts.get(line as usize).copied().unwrap_or(self.len))
    }

    /// Express `position` as a byte-offset span.
    pub fn to_offsets(&self, position: &Position) -> Option<Position> {
        match *position {
            Position::Offsets { .. } => Some(*position),
            Position::Lines {
                start_line,
                end_line,
            } => Some(Position::Offsets {
                start: self.line_start(start_line)? as u64,
                end: self.line_end(end_line)? as u64,
            }),
        }
    }

    /// Express `position` as an inclusive line span.
    pub fn to_lines(&self, position: &Position) -> Option<Position> {
        match *position {
            Position::Lines { .. } => Some(*position),
            Position::Offsets { start, end } => {
                if start as usize > self.len || end < start {
                    return None;
                }
                let last = (end as usize).saturating_sub(1).max(start as usize);
                Some(Position::Lines {
                    start_line: self.line_of(start as usize),
                    end_line: self.line_of(last),
                })
            }
        }
    }
}

fn mismatch(record: &SourceRecord, message: impl Into<String>) -> LodestoneError {
    LodestoneError::SchemaMismatch {
        record_kind: record.kind_name(),
        message: message.into(),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .filter(|s| !s.trim().is_empty())
        .cloned()
}

/// Map a source record onto the canonical [`Chunk`] for `target`.
///
/// The returned chunk has no vectors yet; the embedding router fills them.
/// A `summary` is copied when the source produced one and left `None`
/// otherwise.
///
/// # Errors
///
/// [`LodestoneError::SchemaMismatch`] for an empty source path or URL, empty
/// content, or an inverted span. Only that record fails.
pub fn normalize(record: &SourceRecord, target: &ResolvedTarget) -> Result<Chunk> {
    let mut provenance = Provenance::new();

    let (source_key, content, position, part, class, summary) = match record {
        SourceRecord::Repository(r) => {
            let path = normalize_path(&r.path);
            if path.is_empty() {
                return Err(mismatch(record, "empty repository path"));
            }
            if r.start_line == 0 || r.end_line < r.start_line {
                return Err(mismatch(
                    record,
                    format!("invalid line span {}..={}", r.start_line, r.end_line),
                ));
            }
            provenance.insert("repo".to_string(), r.repo.clone());
            provenance.insert("path".to_string(), path.clone());
            if let Some(branch) = &r.branch {
                provenance.insert("branch".to_string(), branch.clone());
            }
            if let Some(commit) = &r.commit {
                provenance.insert("commit".to_string(), commit.clone());
            }
            (
                path,
                &r.content,
                Position::Lines {
                    start_line: r.start_line,
                    end_line: r.end_line,
                },
                r.part,
                &r.class,
                non_empty(&r.summary),
            )
        }
        SourceRecord::CrawledPage(p) => {
            let url = normalize_url(&p.url)?;
            if p.end_offset < p.start_offset {
                return Err(mismatch(
                    record,
                    format!("invalid offset span {}..{}", p.start_offset, p.end_offset),
                ));
            }
            provenance.insert("url".to_string(), url.clone());
            if let Some(title) = non_empty(&p.title) {
                provenance.insert("title".to_string(), title);
            }
            (
                url,
                &p.content,
                Position::Offsets {
                    start: p.start_offset,
                    end: p.end_offset,
                },
                0,
                &p.class,
                non_empty(&p.summary),
            )
        }
    };

    if content.trim().is_empty() {
        return Err(mismatch(record, format!("empty content at {}", source_key)));
    }

    Ok(Chunk {
        id: chunk_id(&source_key, &position, part, content),
        project_id: target.project_id.clone(),
        dataset_id: target.dataset_id.clone(),
        scope: target.scope,
        content_hash: content_hash(content),
        source_key,
        content: content.clone(),
        summary,
        position,
        part,
        is_code: class.is_code,
        language: class.language.clone(),
        code_confidence: class.confidence,
        dense_vector: Vec::new(),
        sparse_vector: None,
        embedding_model: String::new(),
        provenance,
        indexed_at: chrono::Utc::now().timestamp(),
    })
}
