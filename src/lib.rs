//! # Testlens
//!
//! **A semantic test-case retrieval engine.**
//!
//! Testlens ingests software test corpora (Xray exports and similar),
//! embeds every test and every execution step, and answers natural-language
//! queries with a single ranked list of tests, annotated with the steps
//! that matched.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Normaliser │──▶│   Pipeline    │──▶│   Postgres     │
//! │ Xray/flat  │   │ Embed+Upsert │   │ pgvector ×2   │
//! └────────────┘   └──────────────┘   └──────┬────────┘
//!                                            │
//!                          ┌─────────────────┤
//!                          ▼                 ▼
//!                     ┌─────────┐      ┌──────────┐
//!                     │   CLI   │      │   HTTP   │
//!                     │  (tlx)  │      │  (MCP)   │
//!                     └─────────┘      └──────────┘
//! ```
//!
//! ## Query flow
//!
//! 1. The query is embedded once ([`embedding`]).
//! 2. Filters are validated and compiled to store clauses ([`filter`]).
//! 3. Two kNN calls fan out concurrently — one per tier ([`store`]).
//! 4. Step hits roll up to their parents; doc and step scores fuse into a
//!    single deterministic ranking ([`search`]).
//! 5. Results hydrate into full documents with matched step indices.
//!
//! ## Ingestion flow
//!
//! Raw records are normalised into [`models::TestDoc`]s ([`normalize`]),
//! embedded chunk by chunk with bounded concurrency, and upserted
//! delete-then-insert per uid so re-ingesting is idempotent ([`ingest`]).
//! Progress is checkpointed after every chunk; an interrupted run resumes
//! where it left off.
//!
//! ## Tools
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `search_tests` | Semantic search with filters and scope |
//! | `get_test_by_key` | Direct lookup by external key |
//! | `find_similar_tests` | Tests similar to a reference test |
//! | `ingest_tests` | Batch-ingest corpus files |
//! | `check_health` | Store/provider health snapshot |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Discriminated error kinds shared by every layer |
//! | [`models`] | Core types: `TestDoc`, `TestStep`, `SearchHit`, `IngestReport` |
//! | [`normalize`] | Format preprocessors → canonical documents |
//! | [`embedding`] | Provider abstraction: OpenAI, Ollama, offline hashed |
//! | [`db`] | Postgres connection pool |
//! | [`migrate`] | Schema: pgvector tables, HNSW + filter indexes |
//! | [`store`] | Two-tier vector store adapter |
//! | [`filter`] | Filter whitelist validation and SQL compilation |
//! | [`ingest`] | Chunked ingestion pipeline with checkpoint/resume |
//! | [`search`] | Fan-out, rollup, fusion, similar-to, lookup |
//! | [`server`] | Axum tool surface with rate limits and shutdown |
//! | [`metrics`] | Counters, latency histograms, health snapshot |
//! | [`get`] / [`stats`] | CLI display commands |

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod get;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
