//! `lode chunk <file>`: chunker dry run. Nothing is embedded or stored.

use anyhow::{Context, Result};
use std::path::Path;

use lodestone_core::chunk::{ChunkDescriptor, Chunker, ContentKind};

use crate::config::ChunkingConfig;

pub fn chunk_file(path: &Path, config: &ChunkingConfig) -> Result<Vec<ChunkDescriptor>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let chunker = Chunker::new(config.chunker_config());
    Ok(chunker.chunk(&text, ContentKind::for_path(path)).collect())
}

pub fn run_chunk(path: &Path, config: &ChunkingConfig, json: bool) -> Result<()> {
    let chunks = chunk_file(path, config)?;

    if json {
        let out: Vec<serde_json::Value> = chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "start_line": c.span.start_line,
                    "end_line": c.span.end_line,
                    "start_byte": c.span.start_byte,
                    "end_byte": c.span.end_byte,
                    "chars": c.content.chars().count(),
                    "is_code": c.class.is_code,
                    "language": c.class.language,
                    "confidence": c.class.confidence,
                    "content": c.content,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "chunk {} (max {} / overlap {})",
        path.display(),
        config.max_chars,
        config.overlap_chars
    );
    for (i, c) in chunks.iter().enumerate() {
        let first_line = c.content.lines().next().unwrap_or("").trim();
        let preview: String = first_line.chars().take(60).collect();
        println!(
            "  {:>3}. L{}-{}  bytes {}..{}  {:>4} chars  {} {} ({:.2})  {}",
            i + 1,
            c.span.start_line,
            c.span.end_line,
            c.span.start_byte,
            c.span.end_byte,
            c.content.chars().count(),
            if c.class.is_code { "code" } else { "prose" },
            c.class.language.as_deref().unwrap_or("-"),
            c.class.confidence,
            preview
        );
    }
    println!("  total: {} chunks", chunks.len());
    Ok(())
}
