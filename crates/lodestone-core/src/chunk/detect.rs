//! Lexical code-vs-prose classifier.
//!
//! No parser is involved: the score blends punctuation density, statement
//! terminators, leading keywords, and indentation, and subtracts for lines
//! that read like sentences. Fenced code blocks push the score up and name
//! the language when tagged.

use super::language::Language;
use crate::models::CodeClass;

/// Confidence at or above which a chunk is routed as code.
pub const DEFAULT_CODE_THRESHOLD: f32 = 0.5;

/// Floor applied when the file extension already names a code language.
const KNOWN_LANGUAGE_FLOOR: f32 = 0.9;

const CODE_PUNCT: &[char] = &['{', '}', '(', ')', '[', ']', ';', '=', '<', '>'];

const LEADING_KEYWORDS: &[&str] = &[
    "fn", "pub", "let", "const", "var", "def", "class", "import", "from", "use", "return",
    "if", "for", "while", "func", "struct", "impl", "package", "#include", "async", "await",
    "export", "function", "match", "else", "}", "select", "SELECT",
];

/// Score `text` in `[0.0, 1.0]`; higher means more code-like.
pub fn code_confidence(text: &str) -> f32 {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 0.0;
    }
    let total = lines.len() as f32;

    let non_ws = text.chars().filter(|c| !c.is_whitespace()).count().max(1) as f32;
    let punct = text.chars().filter(|c| CODE_PUNCT.contains(c)).count() as f32;
    let punct_score = (punct / non_ws / 0.08).min(1.0);

    let terminated = lines
        .iter()
        .filter(|l| {
            let t = l.trim_end();
            t.ends_with(';')
                || t.ends_with('{')
                || t.ends_with('}')
                || t.ends_with(':')
                || t.ends_with(')')
                || t.ends_with(',')
        })
        .count() as f32
        / total;

    let keyworded = lines
        .iter()
        .filter(|l| {
            l.split_whitespace()
                .next()
                .map(|first| {
                    let first = first.trim_end_matches(|c: char| c == '(' || c == ':');
                    LEADING_KEYWORDS.contains(&first)
                })
                .unwrap_or(false)
        })
        .count() as f32
        / total;

    let indented = lines
        .iter()
        .filter(|l| l.starts_with("    ") || l.starts_with('\t'))
        .count() as f32
        / total;

    let sentences = lines
        .iter()
        .filter(|l| {
            let t = l.trim_end();
            (t.ends_with('.') || t.ends_with('?') || t.ends_with('!'))
                && t.split_whitespace().count() >= 6
        })
        .count() as f32
        / total;

    let fenced = if text.contains("```") { 0.3 } else { 0.0 };

    let score = 0.35 * punct_score + 0.25 * terminated + 0.25 * keyworded + 0.15 * indented
        - 0.3 * sentences
        + fenced;
    score.clamp(0.0, 1.0)
}

/// Language named by the first fenced block in `text`, if any.
pub fn fenced_language(text: &str) -> Option<Language> {
    text.lines()
        .map(str::trim_start)
        .filter_map(|l| l.strip_prefix("```"))
        .map(str::trim)
        .find(|tag| !tag.is_empty())
        .map(Language::from_fence_tag)
        .filter(|lang| lang.is_code())
}

/// Classify a chunk. `known` is the language implied by the source path.
pub fn classify(text: &str, known: Option<Language>, threshold: f32) -> CodeClass {
    let heuristic = code_confidence(text);
    match known.filter(|l| l.is_code()) {
        Some(lang) => CodeClass {
            is_code: true,
            language: Some(lang.name().to_string()),
            confidence: heuristic.max(KNOWN_LANGUAGE_FLOOR),
        },
        None => {
            let is_code = heuristic >= threshold;
            CodeClass {
                is_code,
                language: if is_code {
                    fenced_language(text).map(|l| l.name().to_string())
                } else {
                    None
                },
                confidence: heuristic,
            }
        }
    }
}
