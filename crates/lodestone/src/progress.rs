//! Ingestion job progress.
//!
//! Every job owns an ordered `tokio::sync::mpsc` channel of
//! [`ProgressEvent`]s. The orchestrator sends through a [`ProgressSink`],
//! which stamps the job id and a per-job sequence number; the CLI drains
//! the receiver into a [`ProgressReporter`]. Reporters write to **stderr**
//! so stdout stays parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle of an ingestion job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Scanning,
    Chunking,
    Embedding,
    Storing,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Scanning => "scanning",
            JobState::Chunking => "chunking",
            JobState::Embedding => "embedding",
            JobState::Storing => "storing",
            JobState::Completed => "completed",
            JobState::CompletedWithErrors => "completed_with_errors",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedWithErrors | JobState::Failed
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressEvent {
    pub job_id: String,
    /// Strictly increasing within one job, starting at 0.
    pub seq: u64,
    pub phase: JobState,
    /// 0..=100.
    pub percent: u8,
    pub detail: String,
}

/// Sending half of a job's progress channel.
///
/// Sends never fail the job: once the receiver is gone, events are dropped.
pub struct ProgressSink {
    job_id: String,
    seq: AtomicU64,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(job_id: impl Into<String>, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            job_id: job_id.into(),
            seq: AtomicU64::new(0),
            tx: Some(tx),
        }
    }

    /// A sink that discards everything.
    pub fn disabled(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            seq: AtomicU64::new(0),
            tx: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn emit(&self, phase: JobState, percent: u8, detail: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = ProgressEvent {
            job_id: self.job_id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            phase,
            percent: percent.min(100),
            detail: detail.into(),
        };
        let _ = tx.send(event);
    }
}

/// Create a job channel.
pub fn channel(
    job_id: impl Into<String>,
) -> (ProgressSink, mpsc::UnboundedReceiver<ProgressEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSink::new(job_id, tx), rx)
}

/// Renders progress events. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress: "ingest 3f2a91c0  embedding   45%  batch 3 / 10".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let short: String = event.job_id.chars().take(8).collect();
        let line = if event.detail.is_empty() {
            format!("ingest {}  {:<21} {:>3}%\n", short, event.phase.as_str(), event.percent)
        } else {
            format!(
                "ingest {}  {:<21} {:>3}%  {}\n",
                short,
                event.phase.as_str(),
                event.percent,
                event.detail
            )
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = serde_json::json!({
            "event": "progress",
            "job_id": event.job_id,
            "seq": event.seq,
            "phase": event.phase,
            "percent": event.percent,
            "detail": event.detail,
        });
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", obj);
        let _ = stderr.flush();
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Forward events to `reporter` until every sender is dropped.
pub async fn drain(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    reporter: Box<dyn ProgressReporter>,
) -> usize {
    let mut seen = 0;
    while let Some(event) = rx.recv().await {
        reporter.report(&event);
        seen += 1;
    }
    seen
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
