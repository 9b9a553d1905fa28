//! Database schema migrations.
//!
//! Creates the two vector tiers and ensures idempotent execution.
//! Designed to be run via `tlx init`.
//!
//! # Schema
//!
//! ```text
//! ┌────────────────────┐        ┌────────────────────┐
//! │     test_docs      │        │     test_steps     │
//! │                    │        │                    │
//! │ uid (PK)           │───┐    │ parent_uid (FK)    │
//! │ external_key       │   └────│ step_index         │
//! │ title              │        │   (PK: uid+index)  │
//! │ description        │        │ action             │
//! │ priority           │        │ data               │
//! │ test_type          │        │ expected TEXT[]    │
//! │ platforms TEXT[]   │        │ embedding vector(D)│
//! │ tags TEXT[]        │        └────────────────────┘
//! │ folder_path TEXT[] │
//! │ related_keys TEXT[]│        ┌────────────────────┐
//! │ source             │        │    engine_meta     │
//! │ ingested_at        │        │ key (PK) / value   │
//! │ embedding vector(D)│        └────────────────────┘
//! └────────────────────┘
//! ```
//!
//! # Indexes
//!
//! - HNSW (`vector_cosine_ops`) on both embedding columns
//! - GIN on `tags`, `platforms`, `related_keys` for containment filters
//! - btree on `priority`, `test_type`, `external_key`, `source`
//!
//! # Dimension guard
//!
//! The vector dimension `D` is fixed when the tables are created and
//! recorded in `engine_meta` together with the embedding model. Running
//! `init` again with a different `(model, dims)` pair is a fatal
//! configuration error; in-place dimension migration is not supported.

use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::{Error, Result};

/// Run all migrations. Safe to call repeatedly against the same store.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let embedder = Embedder::new(&config.embedding)?;
    let dims = embedder.dims();
    let pool = db::connect(config).await?;

    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(&pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS engine_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    check_meta(&pool, "dims", &dims.to_string()).await?;
    check_meta(&pool, "model", embedder.model_name()).await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS test_docs (
            uid TEXT PRIMARY KEY,
            external_key TEXT,
            title TEXT NOT NULL,
            description TEXT,
            priority TEXT,
            test_type TEXT,
            platforms TEXT[] NOT NULL DEFAULT '{{}}',
            tags TEXT[] NOT NULL DEFAULT '{{}}',
            folder_path TEXT[] NOT NULL DEFAULT '{{}}',
            related_keys TEXT[] NOT NULL DEFAULT '{{}}',
            source TEXT NOT NULL,
            ingested_at TIMESTAMPTZ NOT NULL,
            embedding vector({dims}) NOT NULL
        )
        "#,
    ))
    .execute(&pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS test_steps (
            parent_uid TEXT NOT NULL REFERENCES test_docs(uid) ON DELETE CASCADE,
            step_index INTEGER NOT NULL CHECK (step_index >= 1),
            action TEXT NOT NULL,
            data TEXT,
            expected TEXT[] NOT NULL DEFAULT '{{}}',
            embedding vector({dims}) NOT NULL,
            PRIMARY KEY (parent_uid, step_index)
        )
        "#,
    ))
    .execute(&pool)
    .await?;

    // ANN indexes for cosine kNN on both tiers.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_docs_embedding
         ON test_docs USING hnsw (embedding vector_cosine_ops)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_steps_embedding
         ON test_steps USING hnsw (embedding vector_cosine_ops)",
    )
    .execute(&pool)
    .await?;

    // Secondary indexes backing the filter whitelist.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_docs_tags ON test_docs USING gin (tags)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_docs_platforms ON test_docs USING gin (platforms)",
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_docs_related_keys
         ON test_docs USING gin (related_keys)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_docs_priority ON test_docs(priority)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_docs_test_type ON test_docs(test_type)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_test_docs_external_key ON test_docs(external_key)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_test_docs_source ON test_docs(source)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}

/// Record a meta value on first run; reject a mismatch on later runs.
async fn check_meta(pool: &sqlx::PgPool, key: &str, expected: &str) -> Result<()> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT value FROM engine_meta WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    match existing {
        Some(value) if value != expected => Err(Error::FatalConfig(format!(
            "store was created with {} = {}, but configuration says {}; \
             rebuild the store to change it",
            key, value, expected
        ))),
        Some(_) => Ok(()),
        None => {
            sqlx::query("INSERT INTO engine_meta (key, value) VALUES ($1, $2)")
                .bind(key)
                .bind(expected)
                .execute(pool)
                .await?;
            Ok(())
        }
    }
}
