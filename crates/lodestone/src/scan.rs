//! Input enumeration: repository checkouts and crawled-page JSON Lines.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

use crate::config::IngestConfig;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Bytes inspected when sniffing for binary content.
const SNIFF_BYTES: usize = 8000;

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    /// Path relative to the repository root, `/`-separated.
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RepositoryScan {
    pub repo: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    /// Sorted by path.
    pub files: Vec<ScannedFile>,
    /// Binary, oversized, or unreadable files.
    pub skipped: usize,
}

/// Page handed over by the crawler, one JSON object per line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CrawledPage {
    pub url: String,
    pub markdown: String,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(SNIFF_BYTES)].contains(&0)
}

/// Walk a checkout and read every text file that passes the globs.
pub fn scan_repository(root: &Path, config: &IngestConfig) -> Result<RepositoryScan> {
    if !root.is_dir() {
        bail!("Repository root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    let mut skipped = 0;

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !config.include_globs.is_empty() && !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
        if size > config.max_file_bytes {
            tracing::debug!(path = %rel_str, size, "skipping oversized file");
            skipped += 1;
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "unreadable file");
                skipped += 1;
                continue;
            }
        };
        if looks_binary(&bytes) {
            skipped += 1;
            continue;
        }
        match String::from_utf8(bytes) {
            Ok(text) => files.push(ScannedFile {
                path: rel_str,
                text,
            }),
            Err(_) => skipped += 1,
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));

    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let repo = canonical
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| canonical.display().to_string());
    let (branch, commit) = git_head(root);

    Ok(RepositoryScan {
        repo,
        branch,
        commit,
        files,
        skipped,
    })
}

fn git(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Current branch and HEAD commit, when `root` is a git checkout.
fn git_head(root: &Path) -> (Option<String>, Option<String>) {
    let branch = git(root, &["rev-parse", "--abbrev-ref", "HEAD"]).filter(|b| b != "HEAD");
    let commit = git(root, &["rev-parse", "HEAD"]);
    (branch, commit)
}

/// Read crawler output. Blank lines are ignored; a malformed line is an error.
pub fn load_pages(path: &Path) -> Result<Vec<CrawledPage>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open pages file: {}", path.display()))?;
    let mut pages = Vec::new();
    for (i, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let page: CrawledPage = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid page record", path.display(), i + 1))?;
        pages.push(page);
    }
    Ok(pages)
}
