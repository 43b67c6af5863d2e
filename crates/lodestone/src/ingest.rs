//! Ingestion orchestration.
//!
//! One job drives one repository or one set of crawled pages through
//!
//! ```text
//! resolve target ─▶ scan ─▶ chunk ─▶ normalize ─▶ skip unchanged ─▶ embed ─▶ upsert ─▶ prune
//! ```
//!
//! and reports `queued → scanning → chunking → embedding → storing →
//! completed | completed_with_errors | failed` on the job's progress
//! channel. Percent bands: scanning 0–10, chunking 10–30, embedding 30–80,
//! storing 80–100.
//!
//! Chunk ids are content-addressed, so a chunk whose id is already stored
//! for its source is skipped (unless `force`). Failures are recorded per
//! chunk; only target resolution, scanning, and store reads fail the job.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;

use lodestone_core::chunk::{Chunker, ContentKind};
use lodestone_core::error::LodestoneError;
use lodestone_core::identity::normalize;
use lodestone_core::models::{Chunk, PageChunk, RepositoryChunk, Scope, SourceRecord};
use lodestone_core::scope::{self, Catalog, ResolvedTarget};
use lodestone_core::store::{Store, UpsertReport};

use crate::config::{Config, IngestConfig};
use crate::db;
use crate::progress::{self, format_number, JobState, ProgressMode, ProgressSink};
use crate::router::{EmbedOutcome, EmbeddingRouter};
use crate::scan::{scan_repository, CrawledPage, RepositoryScan};

/// Where a job writes.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub project: String,
    pub dataset: String,
    pub scope: Scope,
    /// Re-embed and upsert chunks even when their ids are already stored.
    pub force: bool,
    /// Fail instead of creating unknown projects and datasets.
    pub strict: bool,
}

/// What a job reads.
#[derive(Debug, Clone)]
pub enum IngestInput {
    Repository(PathBuf),
    Pages(Vec<CrawledPage>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailedChunk {
    pub id: String,
    pub source_key: String,
    pub reason: String,
}

/// Completion statistics.
///
/// `indexed + failed.len() + schema_rejected == attempted`. Chunks skipped
/// as unchanged are not attempted.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    pub collection: Option<String>,
    pub sources: usize,
    pub attempted: usize,
    pub indexed: usize,
    pub skipped_unchanged: usize,
    pub failed: Vec<FailedChunk>,
    pub inserted: usize,
    pub updated: usize,
    pub pruned: usize,
    pub schema_rejected: usize,
    /// Files the scanner could not use (binary, oversized, unreadable).
    pub skipped_files: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobReport {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: JobState::Queued,
            collection: None,
            sources: 0,
            attempted: 0,
            indexed: 0,
            skipped_unchanged: 0,
            failed: Vec::new(),
            inserted: 0,
            updated: 0,
            pruned: 0,
            schema_rejected: 0,
            skipped_files: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Normalized chunks of one source (file path or page URL).
#[derive(Debug, Default)]
struct SourceBatch {
    /// Every chunk id the source produced in this run.
    fresh: BTreeSet<String>,
    /// Chunks that still need embedding and storing.
    pending: Vec<Chunk>,
}

pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn Store>,
    router: EmbeddingRouter,
    chunker: Chunker,
    ingest: IngestConfig,
    batch_size: usize,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
        router: EmbeddingRouter,
        chunker: Chunker,
        ingest: IngestConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            router,
            chunker,
            ingest,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn Store>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(
            catalog,
            store,
            EmbeddingRouter::from_config(config)?,
            Chunker::new(config.chunking.chunker_config()),
            config.ingest.clone(),
            config.embedding.batch_size,
        ))
    }

    /// Run one job to completion. Never returns an error: a job that
    /// cannot start ends in [`JobState::Failed`] with `error` set.
    pub async fn run(
        &self,
        request: &IngestRequest,
        input: IngestInput,
        progress: &ProgressSink,
    ) -> JobReport {
        let mut report = JobReport::new(progress.job_id());
        progress.emit(JobState::Queued, 0, "");

        match self.execute(request, input, progress, &mut report).await {
            Ok(()) => {
                report.state = if report.failed.is_empty() && report.schema_rejected == 0 {
                    JobState::Completed
                } else {
                    JobState::CompletedWithErrors
                };
                tracing::info!(
                    job = %report.job_id,
                    state = report.state.as_str(),
                    attempted = report.attempted,
                    indexed = report.indexed,
                    skipped = report.skipped_unchanged,
                    failed = report.failed.len(),
                    "ingestion finished"
                );
                progress.emit(
                    report.state,
                    100,
                    format!(
                        "{} indexed, {} unchanged, {} failed",
                        report.indexed,
                        report.skipped_unchanged,
                        report.failed.len() + report.schema_rejected
                    ),
                );
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(job = %report.job_id, error = %message, "ingestion failed");
                report.state = JobState::Failed;
                report.error = Some(message.clone());
                progress.emit(JobState::Failed, 100, message);
            }
        }
        report.finished_at = Some(Utc::now());
        report
    }

    async fn execute(
        &self,
        request: &IngestRequest,
        input: IngestInput,
        progress: &ProgressSink,
        report: &mut JobReport,
    ) -> anyhow::Result<()> {
        let target = scope::resolve(
            self.catalog.as_ref(),
            &request.project,
            &request.dataset,
            request.scope,
            request.strict || self.ingest.strict,
        )
        .await?;
        report.collection = Some(target.collection.clone());

        // Scanning
        progress.emit(JobState::Scanning, 0, "");
        let records = match input {
            IngestInput::Repository(root) => {
                let scan = self.scan(&root).await?;
                report.skipped_files = scan.skipped;
                progress.emit(
                    JobState::Scanning,
                    10,
                    format!("{} files ({} skipped)", scan.files.len(), scan.skipped),
                );
                self.chunk_repository(&scan, progress)
            }
            IngestInput::Pages(pages) => {
                progress.emit(JobState::Scanning, 10, format!("{} pages", pages.len()));
                self.chunk_pages(&pages, progress)
            }
        };

        // Normalizing
        let mut sources = self.normalize_all(&records, &target, report);
        report.sources = sources.len();
        progress.emit(
            JobState::Chunking,
            30,
            format!("{} chunks from {} sources", records.len(), sources.len()),
        );

        if !request.force {
            self.skip_unchanged(&target, &mut sources, report).await?;
        }

        let pending: Vec<Chunk> = sources
            .values_mut()
            .flat_map(|s| std::mem::take(&mut s.pending))
            .collect();
        report.attempted = pending.len() + report.schema_rejected;
        let source_of: HashMap<String, String> = pending
            .iter()
            .map(|c| (c.id.clone(), c.source_key.clone()))
            .collect();

        // Embedding
        let embedded = self.embed_all(pending, &source_of, progress, report).await;

        // Storing
        self.store_all(&target, embedded, &source_of, progress, report).await;
        self.prune_complete(&target, &sources, report).await;

        Ok(())
    }

    async fn scan(&self, root: &Path) -> anyhow::Result<RepositoryScan> {
        let root = root.to_path_buf();
        let config = self.ingest.clone();
        tokio::task::spawn_blocking(move || scan_repository(&root, &config))
            .await?
            .context("scan failed")
    }

    fn chunk_repository(&self, scan: &RepositoryScan, progress: &ProgressSink) -> Vec<SourceRecord> {
        progress.emit(JobState::Chunking, 10, "");
        let mut records = Vec::new();
        let total = scan.files.len().max(1);
        for (i, file) in scan.files.iter().enumerate() {
            let kind = ContentKind::for_path(Path::new(&file.path));
            let mut previous_line = 0;
            let mut part = 0;
            for d in self.chunker.chunk(&file.text, kind) {
                part = if d.span.start_line == previous_line { part + 1 } else { 0 };
                previous_line = d.span.start_line;
                records.push(SourceRecord::Repository(RepositoryChunk {
                    repo: scan.repo.clone(),
                    branch: scan.branch.clone(),
                    commit: scan.commit.clone(),
                    path: file.path.clone(),
                    content: d.content,
                    start_line: d.span.start_line,
                    end_line: d.span.end_line,
                    part,
                    class: d.class,
                    summary: None,
                }));
            }
            if (i + 1) % 100 == 0 {
                progress.emit(
                    JobState::Chunking,
                    band(10, 30, i + 1, total),
                    format!("{} / {} files", i + 1, total),
                );
            }
        }
        records
    }

    fn chunk_pages(&self, pages: &[CrawledPage], progress: &ProgressSink) -> Vec<SourceRecord> {
        progress.emit(JobState::Chunking, 10, "");
        let mut records = Vec::new();
        let total = pages.len().max(1);
        for (i, page) in pages.iter().enumerate() {
            records.extend(
                self.chunker
                    .chunk(&page.markdown, ContentKind::Document)
                    .map(|d| {
                        SourceRecord::CrawledPage(PageChunk {
                            url: page.url.clone(),
                            title: page.title.clone(),
                            content: d.content,
                            start_offset: d.span.start_byte as u64,
                            end_offset: d.span.end_byte as u64,
                            class: d.class,
                            summary: None,
                        })
                    }),
            );
            if (i + 1) % 100 == 0 {
                progress.emit(
                    JobState::Chunking,
                    band(10, 30, i + 1, total),
                    format!("{} / {} pages", i + 1, total),
                );
            }
        }
        records
    }

    /// Map records onto canonical chunks, grouped by source key.
    fn normalize_all(
        &self,
        records: &[SourceRecord],
        target: &ResolvedTarget,
        report: &mut JobReport,
    ) -> BTreeMap<String, SourceBatch> {
        let mut sources: BTreeMap<String, SourceBatch> = BTreeMap::new();
        for record in records {
            match normalize(record, target) {
                Ok(chunk) => {
                    let source = sources.entry(chunk.source_key.clone()).or_default();
                    if source.fresh.insert(chunk.id.clone()) {
                        source.pending.push(chunk);
                    }
                }
                Err(e) => {
                    tracing::warn!(kind = record.kind_name(), error = %e, "rejected source record");
                    report.schema_rejected += 1;
                }
            }
        }
        sources
    }

    async fn skip_unchanged(
        &self,
        target: &ResolvedTarget,
        sources: &mut BTreeMap<String, SourceBatch>,
        report: &mut JobReport,
    ) -> Result<(), LodestoneError> {
        for (source_key, source) in sources.iter_mut() {
            let stored = self
                .store
                .existing_ids(&target.collection, &target.dataset_id, source_key)
                .await?;
            if stored.is_empty() {
                continue;
            }
            let before = source.pending.len();
            source.pending.retain(|c| !stored.contains(&c.id));
            let skipped = before - source.pending.len();
            if skipped > 0 {
                tracing::debug!(source = %source_key, skipped, "unchanged chunks skipped");
            }
            report.skipped_unchanged += skipped;
        }
        Ok(())
    }

    async fn embed_all(
        &self,
        pending: Vec<Chunk>,
        source_of: &HashMap<String, String>,
        progress: &ProgressSink,
        report: &mut JobReport,
    ) -> Vec<Chunk> {
        let batches: Vec<Vec<Chunk>> = pending
            .chunks(self.batch_size)
            .map(|b| b.to_vec())
            .collect();
        let total = batches.len();
        progress.emit(
            JobState::Embedding,
            30,
            format!("{} chunks in {} batches", pending.len(), total),
        );

        let max_in_flight = self.ingest.max_in_flight_batches.max(1);
        let retries = self.ingest.batch_retries;
        let mut queue = batches.into_iter().enumerate();
        let mut set = JoinSet::new();
        let mut in_flight: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut finished: BTreeMap<usize, EmbedOutcome> = BTreeMap::new();

        loop {
            while set.len() < max_in_flight {
                let Some((index, batch)) = queue.next() else {
                    break;
                };
                in_flight.insert(index, batch.iter().map(|c| c.id.clone()).collect());
                let router = self.router.clone();
                set.spawn(async move { (index, embed_with_retries(&router, batch, retries).await) });
            }

            let Some(joined) = set.join_next().await else {
                break;
            };
            match joined {
                Ok((index, outcome)) => {
                    in_flight.remove(&index);
                    finished.insert(index, outcome);
                }
                Err(e) => tracing::error!(error = %e, "embedding batch task aborted"),
            }
            let done = total - queue.len() - set.len();
            progress.emit(
                JobState::Embedding,
                band(30, 80, done, total),
                format!("batch {} / {}", done, total),
            );
        }

        let mut embedded = Vec::new();
        for (_, outcome) in finished {
            embedded.extend(outcome.embedded);
            for failure in outcome.failed {
                report.failed.push(FailedChunk {
                    source_key: source_of.get(&failure.id).cloned().unwrap_or_default(),
                    id: failure.id,
                    reason: failure.error.to_string(),
                });
            }
        }
        for (_, ids) in in_flight {
            for id in ids {
                report.failed.push(FailedChunk {
                    source_key: source_of.get(&id).cloned().unwrap_or_default(),
                    id,
                    reason: "embedding task aborted".to_string(),
                });
            }
        }
        embedded
    }

    async fn store_all(
        &self,
        target: &ResolvedTarget,
        embedded: Vec<Chunk>,
        source_of: &HashMap<String, String>,
        progress: &ProgressSink,
        report: &mut JobReport,
    ) {
        let batches: Vec<&[Chunk]> = embedded.chunks(self.batch_size).collect();
        let total = batches.len();
        progress.emit(JobState::Storing, 80, format!("{} chunks", embedded.len()));

        for (i, batch) in batches.into_iter().enumerate() {
            match self.upsert_with_retry(&target.collection, batch).await {
                Ok(upserted) => {
                    report.indexed += batch.len();
                    report.inserted += upserted.inserted;
                    report.updated += upserted.updated;
                }
                Err(e) => {
                    tracing::error!(
                        collection = %target.collection,
                        chunks = batch.len(),
                        error = %e,
                        "storage batch failed"
                    );
                    report.failed.extend(batch.iter().map(|c| FailedChunk {
                        id: c.id.clone(),
                        source_key: source_of.get(&c.id).cloned().unwrap_or_default(),
                        reason: e.to_string(),
                    }));
                }
            }
            progress.emit(
                JobState::Storing,
                band(80, 100, i + 1, total),
                format!("batch {} / {}", i + 1, total),
            );
        }
    }

    async fn upsert_with_retry(
        &self,
        collection: &str,
        batch: &[Chunk],
    ) -> Result<UpsertReport, LodestoneError> {
        match self.store.upsert(collection, batch).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!(collection, error = %e, "upsert failed; retrying once");
                self.store.upsert(collection, batch).await
            }
        }
    }

    /// Delete stored chunks a source no longer produces. Sources with a
    /// failed chunk are left alone.
    async fn prune_complete(
        &self,
        target: &ResolvedTarget,
        sources: &BTreeMap<String, SourceBatch>,
        report: &mut JobReport,
    ) {
        let failed_sources: HashSet<&str> =
            report.failed.iter().map(|f| f.source_key.as_str()).collect();
        let mut pruned = 0;
        for (source_key, source) in sources {
            if failed_sources.contains(source_key.as_str()) {
                continue;
            }
            match self
                .store
                .prune(&target.collection, &target.dataset_id, source_key, &source.fresh)
                .await
            {
                Ok(n) => pruned += n,
                Err(e) => {
                    tracing::warn!(source = %source_key, error = %e, "prune failed; stale chunks kept")
                }
            }
        }
        if pruned > 0 {
            tracing::info!(collection = %target.collection, pruned, "pruned stale chunks");
        }
        report.pruned = pruned;
    }
}

/// Entry point for `lode ingest repo` and `lode ingest pages`.
pub async fn run_ingest(
    config: &Config,
    request: IngestRequest,
    input: IngestInput,
    mode: ProgressMode,
) -> anyhow::Result<JobReport> {
    let backends = db::open(config).await?;
    let orchestrator =
        Orchestrator::from_config(config, backends.catalog.clone(), backends.store.clone())?;

    let (sink, rx) = progress::channel(uuid::Uuid::new_v4().to_string());
    let reporter = tokio::spawn(progress::drain(rx, mode.reporter()));
    let report = orchestrator.run(&request, input, &sink).await;
    drop(sink);
    let _ = reporter.await;
    backends.pool.close().await;

    if report.state == JobState::Failed {
        bail!(
            "ingest {}/{} failed: {}",
            request.project,
            request.dataset,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    println!("ingest {}/{}", request.project, request.dataset);
    if let Some(collection) = &report.collection {
        println!("  collection: {}", collection);
    }
    println!("  sources: {}", format_number(report.sources as u64));
    println!("  attempted: {}", format_number(report.attempted as u64));
    println!("  indexed: {}", format_number(report.indexed as u64));
    println!("  unchanged: {}", format_number(report.skipped_unchanged as u64));
    println!(
        "  inserted / updated: {} / {}",
        format_number(report.inserted as u64),
        format_number(report.updated as u64)
    );
    println!("  pruned: {}", format_number(report.pruned as u64));
    if let Some(finished) = report.finished_at {
        let elapsed = finished - report.started_at;
        println!("  elapsed: {:.1}s", elapsed.num_milliseconds() as f64 / 1000.0);
    }
    if report.skipped_files > 0 {
        println!("  skipped files: {}", report.skipped_files);
    }
    if report.schema_rejected > 0 {
        println!("  rejected records: {}", report.schema_rejected);
    }
    if !report.failed.is_empty() {
        println!("  failed chunks: {}", report.failed.len());
        for failure in report.failed.iter().take(10) {
            println!("    {} {}: {}", failure.id, failure.source_key, failure.reason);
        }
        if report.failed.len() > 10 {
            println!("    ... and {} more", report.failed.len() - 10);
        }
    }
    println!("{}", report.state.as_str());
    Ok(report)
}

/// Embed one batch, retrying chunks that failed transiently.
async fn embed_with_retries(router: &EmbeddingRouter, batch: Vec<Chunk>, retries: u32) -> EmbedOutcome {
    let mut outcome = router.embed(batch.clone()).await;

    for attempt in 1..=retries {
        let retry_ids: HashSet<String> = outcome
            .failed
            .iter()
            .filter(|f| f.error.is_transient())
            .map(|f| f.id.clone())
            .collect();
        if retry_ids.is_empty() {
            break;
        }
        tracing::warn!(attempt, chunks = retry_ids.len(), "retrying failed embedding batch");

        let again = router
            .embed(
                batch
                    .iter()
                    .filter(|c| retry_ids.contains(&c.id))
                    .cloned()
                    .collect(),
            )
            .await;
        outcome.failed.retain(|f| !retry_ids.contains(&f.id));
        outcome.embedded.extend(again.embedded);
        outcome.failed.extend(again.failed);
    }
    outcome
}

/// Linear position of `done / total` inside `[from, to]`.
fn band(from: u8, to: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return to;
    }
    let span = (to - from) as usize;
    from + (span * done.min(total) / total) as u8
}
