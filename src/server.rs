//! MCP-compatible HTTP tool server.
//!
//! Exposes the five engine operations as JSON tools for Cursor, Claude, and
//! other MCP-compatible AI assistants.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/search_tests` | Semantic search with filters and scope |
//! | `POST` | `/tools/get_test_by_key` | Direct lookup by external key |
//! | `POST` | `/tools/find_similar_tests` | Tests similar to a reference test |
//! | `POST` | `/tools/ingest_tests` | Ingest one or more corpus files |
//! | `GET`  | `/tools/check_health` | Health snapshot |
//! | `GET`  | `/health` | Liveness (version only) |
//! | `GET`  | `/metrics` | Counter and latency snapshot |
//!
//! # Error contract
//!
//! Every failure is a JSON body with a stable `kind` discriminator:
//!
//! ```json
//! { "error": { "kind": "invalid_input", "message": "…", "fields": [ … ] } }
//! ```
//!
//! | Kind | Status |
//! |------|--------|
//! | `invalid_input` | 400 |
//! | `not_found` | 404 |
//! | `conflict` | 409 |
//! | `rate_limited` | 429 (+ `Retry-After`) |
//! | `transient` | 503 |
//! | `fatal_config` / `internal` | 500 |
//!
//! Internal error messages are redacted; the details go to the log only.
//!
//! # Lifecycle
//!
//! On SIGINT/SIGTERM the listener stops accepting connections and in-flight
//! calls get `server.shutdown_grace_secs` to finish before the process
//! exits. Ingestion checkpoints are flushed after every chunk, so shutdown
//! never loses more than the current chunk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, FieldError, Result};
use crate::filter::SearchFilters;
use crate::ingest::{self, Ingestor, UidLocks};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::models::{IngestReport, SearchHit, TestDoc};
use crate::search::{Scope, SearchEngine, SearchOutcome};
use crate::store::VectorStore;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    engine: SearchEngine,
    ingestor: Ingestor,
    store: VectorStore,
    embedder: Embedder,
    metrics: Arc<Metrics>,
    search_limiter: Arc<RateLimiter>,
    lookup_limiter: Arc<RateLimiter>,
    similar_limiter: Arc<RateLimiter>,
    ingest_limiter: Arc<RateLimiter>,
}

/// Start the tool server and block until shutdown completes.
pub async fn run_server(config: &Config) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&config.embedding)?;
    let engine = SearchEngine::new(store.clone(), embedder.clone(), config.retrieval.clone());
    let ingestor = Ingestor::new(
        store.clone(),
        embedder.clone(),
        config.ingest.clone(),
        Arc::new(UidLocks::new()),
    );

    let state = AppState {
        config: Arc::new(config.clone()),
        engine,
        ingestor,
        store,
        embedder,
        metrics: Arc::new(Metrics::default()),
        search_limiter: Arc::new(RateLimiter::new(config.server.search_rate_per_min)),
        lookup_limiter: Arc::new(RateLimiter::new(config.server.search_rate_per_min)),
        similar_limiter: Arc::new(RateLimiter::new(config.server.search_rate_per_min)),
        ingest_limiter: Arc::new(RateLimiter::new(config.server.ingest_rate_per_min)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/search_tests", post(handle_search))
        .route("/tools/get_test_by_key", post(handle_lookup))
        .route("/tools/find_similar_tests", post(handle_similar))
        .route("/tools/ingest_tests", post(handle_ingest))
        .route("/tools/check_health", get(handle_check_health))
        .route("/health", get(handle_liveness))
        .route("/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(state);

    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, "tool server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::FatalConfig(format!("cannot bind {}: {}", bind_addr, e)))?;

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("shutdown signal received, draining in-flight calls");
                let _ = signal_tx.send(());
            })
            .await
    };

    tokio::select! {
        result = server => {
            result.map_err(|e| Error::Internal(format!("server error: {}", e)))?;
        }
        _ = async {
            let _ = signal_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "shutdown grace expired, aborting in-flight calls");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ============ Rate limiting ============

/// Global fixed-window limiter: at most `cap` calls per minute per tool.
pub struct RateLimiter {
    cap: u32,
    window: std::sync::Mutex<(i64, u32)>,
}

impl RateLimiter {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            window: std::sync::Mutex::new((0, 0)),
        }
    }

    /// Admit or reject a call at the given Unix timestamp.
    pub fn check_at(&self, now_unix: i64) -> Result<()> {
        let minute = now_unix.div_euclid(60);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.0 != minute {
            *window = (minute, 0);
        }
        if window.1 >= self.cap {
            return Err(Error::RateLimited {
                retry_after_secs: (60 - now_unix.rem_euclid(60)) as u64,
            });
        }
        window.1 += 1;
        Ok(())
    }

    pub fn check(&self) -> Result<()> {
        self.check_at(chrono::Utc::now().timestamp())
    }
}

// ============ Error response ============

/// JSON error body carrying the stable `kind` discriminator.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            Error::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::FatalConfig(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let (message, fields) = match &err {
            Error::InvalidInput { message, fields } => (message.clone(), fields.clone()),
            Error::Internal(detail) => {
                error!(detail = %detail, "internal error");
                ("internal error".to_string(), Vec::new())
            }
            other => (other.to_string(), Vec::new()),
        };

        let retry_after_secs = match &err {
            Error::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                kind: err.kind().to_string(),
                message,
                fields,
                retry_after_secs,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Wrap an engine call in the configured search deadline.
async fn with_deadline<T>(
    secs: u64,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(secs), fut)
        .await
        .map_err(|_| Error::Transient(format!("operation exceeded {}s deadline", secs)))?
}

// ============ POST /tools/search_tests ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

impl From<SearchOutcome> for SearchResponse {
    fn from(outcome: SearchOutcome) -> Self {
        Self {
            hits: outcome.hits,
            warning: outcome.warning,
        }
    }
}

fn parse_scope(raw: &Option<String>) -> Result<Scope> {
    match raw {
        None => Ok(Scope::All),
        Some(s) => s.parse(),
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> std::result::Result<Json<SearchResponse>, AppError> {
    let started = Instant::now();
    let result = search_inner(&state, req).await;
    state.metrics.search.record(started, result.is_ok());
    result.map(Json).map_err(AppError)
}

async fn search_inner(state: &AppState, req: SearchRequest) -> Result<SearchResponse> {
    state.search_limiter.check()?;
    let scope = parse_scope(&req.scope)?;
    let filters = match &req.filters {
        Some(raw) => SearchFilters::parse(raw)?,
        None => SearchFilters::default(),
    };
    let outcome = with_deadline(
        state.config.server.search_timeout_secs,
        state.engine.search(&req.query, req.top_k, &filters, scope),
    )
    .await?;
    Ok(outcome.into())
}

// ============ POST /tools/get_test_by_key ============

#[derive(Deserialize)]
struct LookupRequest {
    external_key: String,
}

#[derive(Serialize)]
struct LookupResponse {
    test: TestDoc,
}

async fn handle_lookup(
    State(state): State<AppState>,
    Json(req): Json<LookupRequest>,
) -> std::result::Result<Json<LookupResponse>, AppError> {
    let started = Instant::now();
    let result = lookup_inner(&state, req).await;
    state.metrics.lookup.record(started, result.is_ok());
    result.map(Json).map_err(AppError)
}

async fn lookup_inner(state: &AppState, req: LookupRequest) -> Result<LookupResponse> {
    state.lookup_limiter.check()?;
    let test = with_deadline(
        state.config.server.search_timeout_secs,
        state.engine.lookup_by_key(&req.external_key),
    )
    .await?;
    Ok(LookupResponse { test })
}

// ============ POST /tools/find_similar_tests ============

#[derive(Deserialize)]
struct SimilarRequest {
    /// A uid or an external key; resolved in that order.
    reference: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    scope: Option<String>,
}

async fn handle_similar(
    State(state): State<AppState>,
    Json(req): Json<SimilarRequest>,
) -> std::result::Result<Json<SearchResponse>, AppError> {
    let started = Instant::now();
    let result = similar_inner(&state, req).await;
    state.metrics.similar.record(started, result.is_ok());
    result.map(Json).map_err(AppError)
}

async fn similar_inner(state: &AppState, req: SimilarRequest) -> Result<SearchResponse> {
    state.similar_limiter.check()?;
    let scope = parse_scope(&req.scope)?;
    let outcome = with_deadline(
        state.config.server.search_timeout_secs,
        state.engine.similar(&req.reference, req.top_k, scope),
    )
    .await?;
    Ok(outcome.into())
}

// ============ POST /tools/ingest_tests ============

#[derive(Deserialize)]
struct IngestRequest {
    sources: Vec<SourceDescriptor>,
}

#[derive(Deserialize)]
struct SourceDescriptor {
    /// Stable identifier for checkpointing; defaults to the file stem.
    #[serde(default)]
    id: Option<String>,
    path: PathBuf,
}

#[derive(Serialize)]
struct IngestResponse {
    reports: Vec<SourceReport>,
}

#[derive(Serialize)]
struct SourceReport {
    source_id: String,
    #[serde(flatten)]
    report: IngestReport,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> std::result::Result<Json<IngestResponse>, AppError> {
    let started = Instant::now();
    let result = ingest_inner(&state, req).await;
    state.metrics.ingest.record(started, result.is_ok());
    result.map(Json).map_err(AppError)
}

async fn ingest_inner(state: &AppState, req: IngestRequest) -> Result<IngestResponse> {
    state.ingest_limiter.check()?;
    if req.sources.is_empty() {
        return Err(Error::invalid_fields(
            "at least one source is required",
            vec![FieldError::new("sources", "must not be empty")],
        ));
    }

    let mut reports = Vec::with_capacity(req.sources.len());
    for descriptor in &req.sources {
        let source_id = descriptor.id.clone().unwrap_or_else(|| {
            descriptor
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| descriptor.path.display().to_string())
        });
        let records = ingest::read_records(&descriptor.path)?;
        let report = state.ingestor.run(&source_id, records).await?;
        reports.push(SourceReport { source_id, report });
    }
    Ok(IngestResponse { reports })
}

// ============ GET /tools/check_health ============

async fn handle_check_health(
    State(state): State<AppState>,
) -> std::result::Result<Json<HealthSnapshot>, AppError> {
    let started = Instant::now();
    let store_reachable = state.store.ping().await;
    let counts = if store_reachable {
        state.store.counts().await.unwrap_or_default()
    } else {
        Default::default()
    };

    let embed = state.embedder.counters().snapshot();
    let embed_provider_ok = embed.fatal_failures == 0;
    let last_successful_embed_at = (embed.last_success_unix > 0)
        .then(|| chrono::DateTime::from_timestamp(embed.last_success_unix, 0))
        .flatten()
        .map(|dt| dt.to_rfc3339());

    state.metrics.health.record(started, true);
    Ok(Json(HealthSnapshot {
        store_reachable,
        doc_count: counts.doc_count,
        step_count: counts.step_count,
        embed_provider_ok,
        last_successful_embed_at,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

// ============ GET /health and /metrics ============

#[derive(Serialize)]
struct LivenessResponse {
    status: String,
    version: String,
}

async fn handle_liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_metrics(
    State(state): State<AppState>,
) -> Json<crate::metrics::MetricsSnapshot> {
    Json(
        state
            .metrics
            .snapshot(state.embedder.counters().snapshot()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_enforces_cap_within_window() {
        let limiter = RateLimiter::new(2);
        let t = 1_000_000;
        assert!(limiter.check_at(t).is_ok());
        assert!(limiter.check_at(t + 1).is_ok());
        let err = limiter.check_at(t + 2).unwrap_err();
        match err {
            Error::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn rate_limiter_resets_on_new_window() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check_at(60).is_ok());
        assert!(limiter.check_at(61).is_err());
        assert!(limiter.check_at(120).is_ok());
    }

    #[test]
    fn zero_cap_rejects_everything() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.check_at(0).is_err());
    }
}
