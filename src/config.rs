use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Postgres DSN; the database must have the pgvector extension available.
    pub dsn: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `ollama`, or `hashed` (deterministic offline provider).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Asserted vector dimension; a provider returning anything else is fatal.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding batches in flight at once.
    #[serde(default = "default_embed_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            parallelism: default_embed_parallelism(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    25
}
fn default_embed_parallelism() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the doc-tier score in fusion.
    #[serde(default = "default_doc_weight")]
    pub doc_weight: f64,
    /// Weight of the best step score in fusion.
    #[serde(default = "default_step_weight")]
    pub step_weight: f64,
    /// Step-tier over-fetch factor relative to `top_k`.
    #[serde(default = "default_overfetch")]
    pub overfetch: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Hard cap on `top_k * overfetch`.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_max_query_bytes")]
    pub max_query_bytes: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            doc_weight: default_doc_weight(),
            step_weight: default_step_weight(),
            overfetch: default_overfetch(),
            default_top_k: default_top_k(),
            max_candidates: default_max_candidates(),
            max_query_bytes: default_max_query_bytes(),
        }
    }
}

fn default_doc_weight() -> f64 {
    0.7
}
fn default_step_weight() -> f64 {
    0.3
}
fn default_overfetch() -> usize {
    3
}
fn default_top_k() -> usize {
    20
}
fn default_max_candidates() -> usize {
    1000
}
fn default_max_query_bytes() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Records per pipeline chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks embedding concurrently.
    #[serde(default = "default_ingest_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parallelism: default_ingest_parallelism(),
            checkpoint_path: default_checkpoint_path(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_ingest_parallelism() -> usize {
    2
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./data/ingest-checkpoint.json")
}
fn default_chunk_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_search_rate")]
    pub search_rate_per_min: u32,
    #[serde(default = "default_ingest_rate")]
    pub ingest_rate_per_min: u32,
}

fn default_search_timeout_secs() -> u64 {
    10
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_search_rate() -> u32 {
    60
}
fn default_ingest_rate() -> u32 {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.store.dsn.trim().is_empty() {
        anyhow::bail!("store.dsn must not be empty");
    }
    if config.store.pool_size == 0 {
        anyhow::bail!("store.pool_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or hashed.",
            other
        ),
    }
    if config.embedding.provider != "hashed" {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.parallelism == 0 {
        anyhow::bail!("embedding.parallelism must be > 0");
    }

    let r = &config.retrieval;
    if r.doc_weight < 0.0 || r.step_weight < 0.0 {
        anyhow::bail!("retrieval weights must be non-negative");
    }
    if (r.doc_weight + r.step_weight - 1.0).abs() > 1e-9 {
        anyhow::bail!(
            "retrieval.doc_weight + retrieval.step_weight must sum to 1.0 (got {})",
            r.doc_weight + r.step_weight
        );
    }
    if r.overfetch == 0 {
        anyhow::bail!("retrieval.overfetch must be >= 1");
    }
    if r.default_top_k == 0 || r.default_top_k > 100 {
        anyhow::bail!("retrieval.default_top_k must be in 1..=100");
    }

    if config.ingest.chunk_size == 0 {
        anyhow::bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.parallelism == 0 {
        anyhow::bail!("ingest.parallelism must be > 0");
    }

    Ok(())
}
