//! Black-box tests of the `lode` binary. No model services are configured,
//! so embedding is disabled: ingestion records per-chunk failures and search
//! reports the embedder as unavailable.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let repo = root.join("repo");
    fs::create_dir_all(repo.join("src")).unwrap();
    fs::write(
        repo.join("src/lib.rs"),
        "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n",
    )
    .unwrap();
    fs::write(
        repo.join("README.md"),
        "# Demo\n\nA tiny crate that adds numbers.\n",
    )
    .unwrap();

    fs::create_dir_all(root.join("config")).unwrap();
    let config_path = root.join("config/lodestone.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/data/lodestone.sqlite\"\n\n[ingest]\nbatch_retries = 0\n",
            root.display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run_lode(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_lode"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run lode");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_lode(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/lodestone.sqlite").exists());

    let (_, stderr, success) = run_lode(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_missing_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_lode(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_chunk_dry_run_needs_no_config() {
    let (tmp, _) = setup_test_env();
    let file = tmp.path().join("repo/src/lib.rs");
    let missing = tmp.path().join("missing.toml");

    let (stdout, stderr, success) =
        run_lode(&missing, &["chunk", file.to_str().unwrap(), "--json"]);
    assert!(success, "chunk failed: {}", stderr);
    let chunks: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let chunks = chunks.as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["start_line"], 1);
    assert_eq!(chunks[0]["language"], "rust");
    assert_eq!(chunks[0]["is_code"], true);
}

#[test]
fn test_ingest_without_embedder_completes_with_errors() {
    let (tmp, config_path) = setup_test_env();
    let repo = tmp.path().join("repo");

    let (stdout, stderr, success) = run_lode(
        &config_path,
        &[
            "ingest",
            "repo",
            repo.to_str().unwrap(),
            "--project",
            "acme",
            "--dataset",
            "demo",
            "--scope",
            "local",
        ],
    );
    assert!(success, "ingest failed: {}", stderr);
    assert!(stdout.contains("ingest acme/demo"));
    assert!(stdout.contains("failed chunks: 2"), "{}", stdout);
    assert!(stdout.trim_end().ends_with("completed_with_errors"));

    let (stdout, _, success) = run_lode(&config_path, &["datasets"]);
    assert!(success);
    assert!(stdout.contains("acme"));
    assert!(stdout.contains("demo"));
    assert!(stdout.contains("dataset"));
}

#[test]
fn test_json_progress_on_stderr() {
    let (tmp, config_path) = setup_test_env();
    let repo = tmp.path().join("repo");

    let (_, stderr, success) = run_lode(
        &config_path,
        &[
            "--progress",
            "json",
            "ingest",
            "repo",
            repo.to_str().unwrap(),
            "--project",
            "acme",
            "--dataset",
            "demo",
        ],
    );
    assert!(success, "ingest failed: {}", stderr);

    let events: Vec<serde_json::Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    assert!(!events.is_empty());
    assert_eq!(events[0]["phase"], "queued");
    assert_eq!(events.last().unwrap()["phase"], "completed_with_errors");
    assert_eq!(events.last().unwrap()["percent"], 100);
}

#[test]
fn test_invalid_scope_is_rejected() {
    let (tmp, config_path) = setup_test_env();
    let repo = tmp.path().join("repo");

    let (_, stderr, success) = run_lode(
        &config_path,
        &[
            "ingest",
            "repo",
            repo.to_str().unwrap(),
            "--project",
            "acme",
            "--dataset",
            "demo",
            "--scope",
            "team",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("unknown scope"));
}

#[test]
fn test_malformed_pages_file_reports_line() {
    let (tmp, config_path) = setup_test_env();
    let pages = tmp.path().join("pages.jsonl");
    fs::write(
        &pages,
        "{\"url\": \"https://example.com/a\", \"markdown\": \"# A\"}\n\nnot json\n",
    )
    .unwrap();

    let (_, stderr, success) = run_lode(
        &config_path,
        &[
            "ingest",
            "pages",
            pages.to_str().unwrap(),
            "--project",
            "acme",
            "--dataset",
            "web",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("pages.jsonl:3"), "{}", stderr);
}

#[test]
fn test_search_without_embedder_is_unavailable() {
    let (tmp, config_path) = setup_test_env();
    let repo = tmp.path().join("repo");
    run_lode(
        &config_path,
        &[
            "ingest",
            "repo",
            repo.to_str().unwrap(),
            "--project",
            "acme",
            "--dataset",
            "demo",
            "--scope",
            "global",
        ],
    );

    let (_, stderr, success) = run_lode(&config_path, &["search", "add numbers", "--project", "acme"]);
    assert!(!success);
    assert!(stderr.contains("service unavailable"), "{}", stderr);

    let (_, stderr, success) = run_lode(
        &config_path,
        &["search", "add numbers", "--project", "acme", "--dataset", "nope", "--no-global"],
    );
    assert!(!success);
    assert!(stderr.contains("no accessible data"), "{}", stderr);
}

#[test]
fn test_deactivate_unknown_dataset_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_lode(&config_path, &["init"]);

    let (_, stderr, success) = run_lode(&config_path, &["datasets", "deactivate", "acme", "demo"]);
    assert!(!success);
    assert!(stderr.contains("Unknown project"));
}
