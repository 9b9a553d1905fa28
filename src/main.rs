//! # Testlens CLI (`tlx`)
//!
//! The `tlx` binary drives the test-retrieval engine: store initialization,
//! corpus ingestion, search, lookup, similarity, and the MCP tool server.
//!
//! ## Usage
//!
//! ```bash
//! tlx --config ./config/testlens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tlx init` | Create the pgvector schema and indexes |
//! | `tlx ingest <file>` | Ingest a test corpus JSON file |
//! | `tlx search "<query>"` | Semantic search over the corpus |
//! | `tlx get <key>` | Look up one test by external key or uid |
//! | `tlx similar <ref>` | Find tests similar to a reference test |
//! | `tlx delete <uid>` | Delete a test and its steps |
//! | `tlx stats` | Store counts and breakdowns |
//! | `tlx serve mcp` | Start the MCP tool server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use testlens::config;
use testlens::db;
use testlens::embedding::Embedder;
use testlens::filter::SearchFilters;
use testlens::ingest::{self, Ingestor, UidLocks};
use testlens::search::{Scope, SearchEngine};
use testlens::store::VectorStore;
use testlens::{get, migrate, server, stats};

/// Testlens — semantic search over software test corpora.
#[derive(Parser)]
#[command(
    name = "tlx",
    about = "Testlens — semantic test-case retrieval over a two-tier vector index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/testlens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema.
    ///
    /// Creates the pgvector extension, both tier tables, and all indexes.
    /// Idempotent — running it again is safe, but changing the embedding
    /// model or dimension against an existing store is rejected.
    Init,

    /// Ingest a test corpus from a JSON file.
    ///
    /// The file may be a top-level array of records or an object wrapping
    /// one under `rows`, `tests`, or `records`. Ingestion checkpoints after
    /// every chunk and resumes automatically after interruption.
    Ingest {
        /// Path to the corpus JSON file.
        path: PathBuf,

        /// Stable source identifier for checkpointing and provenance.
        /// Defaults to the file stem.
        #[arg(long)]
        source_id: Option<String>,
    },

    /// Search tests semantically.
    Search {
        /// The search query text.
        query: String,

        /// Number of results to return (1..=100).
        #[arg(long)]
        top_k: Option<usize>,

        /// Search scope: `all`, `docs`, or `steps`.
        #[arg(long, default_value = "all")]
        scope: String,

        /// Require this tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Require this platform (repeatable).
        #[arg(long = "platform")]
        platforms: Vec<String>,

        /// Exact priority match (Critical, High, Medium, Low).
        #[arg(long)]
        priority: Option<String>,

        /// Exact test type match.
        #[arg(long)]
        test_type: Option<String>,

        /// Folder prefix, `/`-separated (e.g. `Functional/Login`).
        #[arg(long)]
        folder: Option<String>,

        /// Require intersection with this related key (repeatable).
        #[arg(long = "related-key")]
        related_keys: Vec<String>,

        /// Anchored glob on the external key (`*` and `?` only).
        #[arg(long)]
        key_pattern: Option<String>,
    },

    /// Look up one test by external key (or uid).
    Get {
        /// External key (e.g. `PROJ-123`) or uid.
        key: String,
    },

    /// Find tests similar to a reference test.
    Similar {
        /// Reference test: a uid or a unique external key.
        reference: String,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long, default_value = "all")]
        scope: String,
    },

    /// Delete a test document and all of its steps.
    Delete {
        /// The uid of the test to delete.
        uid: String,
    },

    /// Show store counts and breakdowns.
    Stats,

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the MCP tool server.
    Mcp,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Store initialized successfully.");
        }
        Commands::Ingest { path, source_id } => {
            run_ingest(&cfg, &path, source_id).await?;
        }
        Commands::Search {
            query,
            top_k,
            scope,
            tags,
            platforms,
            priority,
            test_type,
            folder,
            related_keys,
            key_pattern,
        } => {
            let filters = SearchFilters {
                tags: non_empty(tags),
                platforms: non_empty(platforms),
                priority,
                test_type,
                folder_prefix: folder.map(|f| {
                    f.split('/')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }),
                related_keys: non_empty(related_keys),
                external_key_pattern: key_pattern,
            };
            run_search(&cfg, &query, top_k, &scope, &filters).await?;
        }
        Commands::Get { key } => {
            get::run_get(&cfg, &key).await?;
        }
        Commands::Similar {
            reference,
            top_k,
            scope,
        } => {
            run_similar(&cfg, &reference, top_k, &scope).await?;
        }
        Commands::Delete { uid } => {
            run_delete(&cfg, &uid).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp => {
                server::run_server(&cfg).await?;
            }
        },
    }

    Ok(())
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

async fn run_ingest(
    cfg: &config::Config,
    path: &std::path::Path,
    source_id: Option<String>,
) -> Result<()> {
    let source_id = source_id.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    });

    // Read and validate the source before touching the store.
    let records = ingest::read_records(path)?;

    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&cfg.embedding)?;
    let ingestor = Ingestor::new(
        store.clone(),
        embedder,
        cfg.ingest.clone(),
        Arc::new(UidLocks::new()),
    );

    let report = ingestor.run(&source_id, records).await?;

    println!("ingest {}", source_id);
    println!("  records in:    {}", report.docs_in);
    println!("  docs written:  {}", report.docs_written);
    println!("  steps written: {}", report.steps_written);
    println!("  skipped:       {}", report.skipped);
    if !report.warnings.is_empty() {
        println!("  warnings:      {}", report.warnings.len());
        for warning in report.warnings.iter().take(20) {
            println!("    - {}", warning);
        }
        if report.warnings.len() > 20 {
            println!("    … and {} more", report.warnings.len() - 20);
        }
    }
    if !report.errors.is_empty() {
        println!("  errors:        {}", report.errors.len());
        for error in &report.errors {
            println!("    - {}", error);
        }
    }
    println!("ok");

    store.pool().close().await;
    Ok(())
}

async fn run_search(
    cfg: &config::Config,
    query: &str,
    top_k: Option<usize>,
    scope: &str,
    filters: &SearchFilters,
) -> Result<()> {
    let scope: Scope = scope.parse()?;

    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&cfg.embedding)?;
    let engine = SearchEngine::new(store.clone(), embedder, cfg.retrieval.clone());

    let outcome = engine.search(query, top_k, filters, scope).await?;
    print_hits(&outcome);

    store.pool().close().await;
    Ok(())
}

async fn run_similar(
    cfg: &config::Config,
    reference: &str,
    top_k: Option<usize>,
    scope: &str,
) -> Result<()> {
    let scope: Scope = scope.parse()?;

    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&cfg.embedding)?;
    let engine = SearchEngine::new(store.clone(), embedder, cfg.retrieval.clone());

    let outcome = engine.similar(reference, top_k, scope).await?;
    print_hits(&outcome);

    store.pool().close().await;
    Ok(())
}

async fn run_delete(cfg: &config::Config, uid: &str) -> Result<()> {
    let pool = db::connect(cfg).await?;
    let store = VectorStore::new(pool);

    let steps = store.delete_steps_by_parent(uid).await?;
    let docs = store.delete_doc(uid).await?;
    if docs == 0 {
        println!("No test with uid {}", uid);
    } else {
        println!("Deleted {} ({} steps)", uid, steps);
    }

    store.pool().close().await;
    Ok(())
}

fn print_hits(outcome: &testlens::search::SearchOutcome) {
    if let Some(warning) = &outcome.warning {
        eprintln!("Warning: {}", warning);
    }
    if outcome.hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in outcome.hits.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, hit.score, hit.doc.title);
        println!("    uid: {}", hit.uid);
        if let Some(key) = &hit.doc.external_key {
            println!("    key: {}", key);
        }
        if let Some(priority) = hit.doc.priority {
            println!("    priority: {}", priority.as_str());
        }
        if !hit.matched_step_indices.is_empty() {
            let indices: Vec<String> = hit
                .matched_step_indices
                .iter()
                .map(|i| i.to_string())
                .collect();
            println!("    matched steps: {}", indices.join(", "));
        }
        println!();
    }
}
