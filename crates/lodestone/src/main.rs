//! # Lodestone CLI (`lode`)
//!
//! ```bash
//! lode --config ./config/lodestone.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lode init` | Create the SQLite database and run schema migrations |
//! | `lode ingest repo <path>` | Ingest a repository checkout into a dataset |
//! | `lode ingest pages <file.jsonl>` | Ingest crawled pages into a dataset |
//! | `lode search "<query>"` | Hybrid search over the datasets a project can read |
//! | `lode datasets` | List projects, datasets, scopes, and chunk counts |
//! | `lode chunk <file>` | Show how a file would be chunked |
//!
//! Logs go to stderr (`RUST_LOG`, default `lodestone=info`); results go to
//! stdout.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lodestone::config;
use lodestone::ingest::{run_ingest, IngestInput, IngestRequest};
use lodestone::progress::ProgressMode;
use lodestone::query::{run_search, QueryRequest};
use lodestone::{chunk_cmd, datasets, migrate, scan};
use lodestone_core::models::Scope;
use lodestone_core::scope::ScopeFilter;
use lodestone_core::store::SearchFilter;

/// Lodestone: ingest repositories and crawled pages, search them with
/// hybrid dense + sparse retrieval.
#[derive(Parser)]
#[command(name = "lode", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lodestone.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, else `off`.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a repository or crawled pages into a dataset.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Search every dataset the project can read.
    Search {
        /// The search query string.
        query: String,

        #[arg(long)]
        project: String,

        /// Restrict to one dataset of the project (global datasets still apply).
        #[arg(long)]
        dataset: Option<String>,

        /// Exclude global-scope datasets.
        #[arg(long)]
        no_global: bool,

        /// Maximum number of results.
        #[arg(long)]
        top_k: Option<usize>,

        /// Only chunks from this repository.
        #[arg(long)]
        repo: Option<String>,

        /// Only chunks in this language (e.g. `rust`).
        #[arg(long)]
        language: Option<String>,

        /// Only code chunks.
        #[arg(long, conflicts_with = "prose")]
        code: bool,

        /// Only prose chunks.
        #[arg(long)]
        prose: bool,

        /// Only chunks whose path or URL starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List datasets, or toggle whether queries can see one.
    Datasets {
        #[command(subcommand)]
        action: Option<DatasetAction>,
    },

    /// Chunker dry run: print spans and code classification for a file.
    Chunk {
        path: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct Target {
    #[arg(long)]
    project: String,

    #[arg(long)]
    dataset: String,

    /// Visibility: `global`, `project`, or `dataset` (alias `local`).
    #[arg(long, default_value = "project")]
    scope: String,

    /// Re-embed and upsert chunks even when unchanged.
    #[arg(long)]
    force: bool,

    /// Fail on unknown project or dataset instead of creating them.
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand)]
enum IngestSource {
    /// Ingest a repository checkout.
    Repo {
        path: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Ingest crawler output (JSON Lines of `{url, markdown, links}`).
    Pages {
        file: PathBuf,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Subcommand)]
enum DatasetAction {
    /// List every dataset (the default).
    List,
    /// Make a dataset visible to queries.
    Activate { project: String, dataset: String },
    /// Hide a dataset from queries without deleting its chunks.
    Deactivate { project: String, dataset: String },
}

impl Target {
    fn request(&self) -> anyhow::Result<IngestRequest> {
        Ok(IngestRequest {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            scope: self.scope.parse::<Scope>()?,
            force: self.force,
            strict: self.strict,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lodestone=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config;
    let load = || config::load_config(&config_path);
    let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            let cfg = load()?;
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { source } => match source {
            IngestSource::Repo { path, target } => {
                let cfg = load()?;
                run_ingest(&cfg, target.request()?, IngestInput::Repository(path), progress).await?;
            }
            IngestSource::Pages { file, target } => {
                let cfg = load()?;
                let pages = scan::load_pages(&file)?;
                run_ingest(&cfg, target.request()?, IngestInput::Pages(pages), progress).await?;
            }
        },
        Commands::Search {
            query,
            project,
            dataset,
            no_global,
            top_k,
            repo,
            language,
            code,
            prose,
            prefix,
            json,
        } => {
            let request = QueryRequest {
                scope: match dataset {
                    Some(name) => ScopeFilter::Dataset(name),
                    None => ScopeFilter::Project,
                },
                top_k,
                include_global: no_global.then_some(false),
                filter: SearchFilter {
                    repo,
                    language,
                    is_code: match (code, prose) {
                        (true, _) => Some(true),
                        (_, true) => Some(false),
                        _ => None,
                    },
                    source_prefix: prefix,
                    ..SearchFilter::default()
                },
                ..QueryRequest::new(query, project)
            };
            run_search(&load()?, &request, json).await?;
        }
        Commands::Datasets { action } => {
            let cfg = load()?;
            match action.unwrap_or(DatasetAction::List) {
                DatasetAction::List => datasets::run_datasets(&cfg).await?,
                DatasetAction::Activate { project, dataset } => {
                    datasets::run_set_active(&cfg, &project, &dataset, true).await?
                }
                DatasetAction::Deactivate { project, dataset } => {
                    datasets::run_set_active(&cfg, &project, &dataset, false).await?
                }
            }
        }
        Commands::Chunk { path, json } => {
            // Dry run: no database needed, so a missing config means defaults.
            let chunking = load().map(|c| c.chunking).unwrap_or_default();
            chunk_cmd::run_chunk(&path, &chunking, json)?;
        }
    }

    Ok(())
}
