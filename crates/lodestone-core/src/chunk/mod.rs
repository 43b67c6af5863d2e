//! Budgeted, overlapping text chunker with code-aware splitting.
//!
//! Splits a document into segments of at most `max_chars` characters that
//! overlap their predecessor by up to `overlap_chars`. Every segment carries
//! its byte span and 1-based line span in the original text plus a
//! code/prose classification.
//!
//! # Algorithm
//!
//! 1. Cut the text into contiguous *pieces* no longer than `max_chars`,
//!    trying separators in order and recursing into oversized parts:
//!    - code with a unit grammar: top-level unit starts, then `\n\n`, `\n`, ` `
//!    - other code: `\n\n`, `\n`, ` `
//!    - documents: `\n\n`, `\n`, `. `, ` `
//!    - last resort: a hard split on char boundaries.
//! 2. Lazily pack consecutive pieces into chunks up to `max_chars`.
//! 3. Start the next chunk on the trailing pieces of the previous one whose
//!    combined length fits in `overlap_chars`. Every chunk advances by at
//!    least one piece.
//! 4. Trim surrounding whitespace and classify the chunk.
//!
//! # Example
//!
//! ```rust
//! use lodestone_core::chunk::{Chunker, ChunkerConfig, ContentKind};
//!
//! let chunker = Chunker::new(ChunkerConfig::default());
//! let chunks: Vec<_> = chunker
//!     .chunk("Hello world.\n\nSecond paragraph.", ContentKind::Document)
//!     .collect();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].span.start_line, 1);
//! assert_eq!(chunks[0].span.end_line, 3);
//! ```

pub mod detect;
pub mod language;

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use crate::identity::LineIndex;
use crate::models::CodeClass;

pub use language::Language;

pub const DEFAULT_MAX_CHARS: usize = 1000;
pub const DEFAULT_OVERLAP_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Upper bound on chunk length, in characters.
    pub max_chars: usize,
    /// Characters of trailing context repeated at the start of the next chunk.
    pub overlap_chars: usize,
    /// Confidence at or above which a chunk counts as code.
    pub code_threshold: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
            code_threshold: detect::DEFAULT_CODE_THRESHOLD,
        }
    }
}

/// What kind of text is being chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Source code in a known language (from the file extension).
    Code(Language),
    /// Markdown, plain text, or crawled pages; classified per chunk.
    Document,
}

impl ContentKind {
    pub fn for_path(path: &Path) -> Self {
        let lang = Language::from_path(path);
        if lang.is_code() {
            ContentKind::Code(lang)
        } else {
            ContentKind::Document
        }
    }

    fn known_language(&self) -> Option<Language> {
        match self {
            ContentKind::Code(lang) => Some(*lang),
            ContentKind::Document => None,
        }
    }
}

/// Location of a chunk in the text it was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based, inclusive.
    pub start_line: u32,
    /// 1-based, inclusive.
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDescriptor {
    pub content: String,
    pub span: Span,
    pub class: CodeClass,
}

#[derive(Debug, Clone, Copy)]
enum Separator {
    Units(Language),
    Literal(&'static str),
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        let max_chars = config.max_chars.max(1);
        Self {
            config: ChunkerConfig {
                max_chars,
                overlap_chars: config.overlap_chars.min(max_chars - 1),
                code_threshold: config.code_threshold,
            },
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Lazily chunk `text`. The returned iterator is finite and `Clone`;
    /// a clone replays from the clone point.
    pub fn chunk<'a>(&self, text: &'a str, kind: ContentKind) -> Chunks<'a> {
        let separators = separators_for(kind);
        let mut pieces = Vec::new();
        split_recursive(text, 0..text.len(), &separators, self.config.max_chars, &mut pieces);
        let lengths: Vec<usize> = pieces.iter().map(|r| char_len(text, r)).collect();
        Chunks {
            text,
            pieces: pieces.into(),
            lengths: lengths.into(),
            lines: Arc::new(LineIndex::new(text)),
            next: 0,
            kind,
            config: self.config.clone(),
        }
    }
}

/// Lazy chunk sequence returned by [`Chunker::chunk`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    pieces: Arc<[Range<usize>]>,
    lengths: Arc<[usize]>,
    lines: Arc<LineIndex>,
    next: usize,
    kind: ContentKind,
    config: ChunkerConfig,
}

impl Chunks<'_> {
    /// Rewind to the first chunk.
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for Chunks<'_> {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<ChunkDescriptor> {
        let n = self.pieces.len();
        while self.next < n {
            let first = self.next;
            let mut last = first;
            let mut len = 0usize;
            while last < n {
                let piece_len = self.lengths[last];
                if last > first && len + piece_len > self.config.max_chars {
                    break;
                }
                len += piece_len;
                last += 1;
            }

            self.next = if last >= n {
                n
            } else {
                let mut start = last;
                let mut overlap = 0usize;
                while start > first + 1 && overlap + self.lengths[start - 1] <= self.config.overlap_chars {
                    overlap += self.lengths[start - 1];
                    start -= 1;
                }
                start
            };

            let range = self.pieces[first].start..self.pieces[last - 1].end;
            if let Some(chunk) = self.describe(range) {
                return Some(chunk);
            }
        }
        None
    }
}

impl Chunks<'_> {
    fn describe(&self, range: Range<usize>) -> Option<ChunkDescriptor> {
        let raw = &self.text[range.clone()];
        let trimmed_start = raw.len() - raw.trim_start().len();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let start_byte = range.start + trimmed_start;
        let end_byte = start_byte + trimmed.len();
        Some(ChunkDescriptor {
            content: trimmed.to_string(),
            span: Span {
                start_byte,
                end_byte,
                start_line: self.lines.line_of(start_byte),
                end_line: self.lines.line_of(end_byte - 1),
            },
            class: detect::classify(
                trimmed,
                self.kind.known_language(),
                self.config.code_threshold,
            ),
        })
    }
}

fn separators_for(kind: ContentKind) -> Vec<Separator> {
    match kind {
        ContentKind::Code(lang) if lang.has_unit_grammar() => vec![
            Separator::Units(lang),
            Separator::Literal("\n\n"),
            Separator::Literal("\n"),
            Separator::Literal(" "),
        ],
        ContentKind::Code(_) => vec![
            Separator::Literal("\n\n"),
            Separator::Literal("\n"),
            Separator::Literal(" "),
        ],
        ContentKind::Document => vec![
            Separator::Literal("\n\n"),
            Separator::Literal("\n"),
            Separator::Literal(". "),
            Separator::Literal(" "),
        ],
    }
}

fn char_len(text: &str, range: &Range<usize>) -> usize {
    text[range.clone()].chars().count()
}

/// Partition `range` into contiguous pieces of at most `max_chars` chars.
fn split_recursive(
    text: &str,
    range: Range<usize>,
    separators: &[Separator],
    max_chars: usize,
    out: &mut Vec<Range<usize>>,
) {
    if range.is_empty() {
        return;
    }
    if char_len(text, &range) <= max_chars {
        out.push(range);
        return;
    }
    let Some((sep, rest)) = separators.split_first() else {
        hard_split(text, range, max_chars, out);
        return;
    };

    let cuts = match sep {
        Separator::Units(lang) => unit_boundaries(text, &range, *lang),
        Separator::Literal(s) => literal_boundaries(text, &range, s),
    };
    if cuts.is_empty() {
        split_recursive(text, range, rest, max_chars, out);
        return;
    }

    let mut start = range.start;
    for cut in cuts.into_iter().chain(std::iter::once(range.end)) {
        let part = start..cut;
        if char_len(text, &part) <= max_chars {
            if !part.is_empty() {
                out.push(part);
            }
        } else {
            split_recursive(text, part, rest, max_chars, out);
        }
        start = cut;
    }
}

/// Offsets just after each occurrence of `sep`, strictly inside `range`.
fn literal_boundaries(text: &str, range: &Range<usize>, sep: &str) -> Vec<usize> {
    text[range.clone()]
        .match_indices(sep)
        .map(|(i, _)| range.start + i + sep.len())
        .filter(|&cut| cut < range.end)
        .collect()
}

/// Line starts that open a top-level unit, moved up over attached
/// attribute/decorator/doc lines.
fn unit_boundaries(text: &str, range: &Range<usize>, lang: Language) -> Vec<usize> {
    let slice = &text[range.clone()];
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in slice.split_inclusive('\n') {
        lines.push((range.start + offset, line.trim_end_matches(['\n', '\r'])));
        offset += line.len();
    }

    let mut cuts = Vec::new();
    for (i, (line_start, line)) in lines.iter().enumerate() {
        if !lang.is_unit_start(line) {
            continue;
        }
        let mut first = i;
        while first > 0 && lang.is_unit_prefix(lines[first - 1].1) {
            first -= 1;
        }
        let cut = if first == i { *line_start } else { lines[first].0 };
        if cut > range.start && cuts.last().map_or(true, |&prev| cut > prev) {
            cuts.push(cut);
        }
    }
    cuts
}

/// Cut every `max_chars` characters.
fn hard_split(text: &str, range: Range<usize>, max_chars: usize, out: &mut Vec<Range<usize>>) {
    let mut start = range.start;
    let mut count = 0;
    for (i, _) in text[range.clone()].char_indices() {
        if count == max_chars {
            out.push(start..range.start + i);
            start = range.start + i;
            count = 0;
        }
        count += 1;
    }
    if start < range.end {
        out.push(start..range.end);
    }
}
