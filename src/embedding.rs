//! Embedding provider abstraction.
//!
//! [`Embedder`] turns batches of text into fixed-dimension, L2-normalised
//! vectors. Three providers are supported, selected by configuration:
//!
//! - **`openai`** — calls the OpenAI embeddings API.
//! - **`ollama`** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **`hashed`** — deterministic offline feature-hash embedder; no network.
//!
//! Input is split into batches of `embedding.batch_size`, dispatched with at
//! most `embedding.parallelism` calls in flight, and reassembled in input
//! order. Blank texts never reach a provider: they map to the all-zero
//! vector, the documented zero-information embedding.
//!
//! # Retry strategy
//!
//! Each batch call is retried with exponential backoff (1s, 2s, 4s, … capped
//! at 32s) up to `embedding.max_retries` attempts. Failures are classified:
//!
//! - HTTP 429 / 5xx / network errors → [`Error::Transient`], retried.
//! - HTTP 401 / 403 → [`Error::FatalConfig`], never retried.
//! - Other 4xx → [`Error::InvalidInput`] tagged with the batch's first input
//!   index, never retried.
//!
//! A vector coming back with the wrong dimension is `FatalConfig`: it means
//! the configured model and `embedding.dims` disagree.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Default dimension for the hashed provider when none is configured.
const HASHED_DEFAULT_DIMS: usize = 256;

/// Backend selector. The rest of the engine never branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    OpenAi,
    Ollama,
    Hashed,
}

/// Usage and failure counters, shared across all clones of an [`Embedder`].
#[derive(Debug, Default)]
pub struct EmbedCounters {
    pub requests: AtomicU64,
    pub tokens_consumed: AtomicU64,
    pub transient_failures: AtomicU64,
    pub invalid_input_failures: AtomicU64,
    pub fatal_failures: AtomicU64,
    /// Unix seconds of the last successful provider call; 0 = never.
    pub last_success_unix: AtomicI64,
}

/// Point-in-time snapshot of [`EmbedCounters`] for health and stats output.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedSnapshot {
    pub requests: u64,
    pub tokens_consumed: u64,
    pub transient_failures: u64,
    pub invalid_input_failures: u64,
    pub fatal_failures: u64,
    pub last_success_unix: i64,
}

impl EmbedCounters {
    pub fn snapshot(&self) -> EmbedSnapshot {
        EmbedSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            tokens_consumed: self.tokens_consumed.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            invalid_input_failures: self.invalid_input_failures.load(Ordering::Relaxed),
            fatal_failures: self.fatal_failures.load(Ordering::Relaxed),
            last_success_unix: self.last_success_unix.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self, err: &Error) {
        match err {
            Error::Transient(_) => self.transient_failures.fetch_add(1, Ordering::Relaxed),
            Error::InvalidInput { .. } => {
                self.invalid_input_failures.fetch_add(1, Ordering::Relaxed)
            }
            _ => self.fatal_failures.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Shared embedding client. Cheap to clone; all clones share the same
/// connection pool, concurrency limiter, and counters.
#[derive(Clone, Debug)]
pub struct Embedder {
    provider: Provider,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
    url: Option<String>,
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    counters: Arc<EmbedCounters>,
}

impl Embedder {
    /// Build an embedder from configuration.
    ///
    /// Fails with [`Error::FatalConfig`] for unknown providers or a missing
    /// `OPENAI_API_KEY` when the openai provider is selected.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let provider = match config.provider.as_str() {
            "openai" => {
                if std::env::var("OPENAI_API_KEY").is_err() {
                    return Err(Error::FatalConfig(
                        "OPENAI_API_KEY environment variable not set".to_string(),
                    ));
                }
                Provider::OpenAi
            }
            "ollama" => Provider::Ollama,
            "hashed" => Provider::Hashed,
            other => {
                return Err(Error::FatalConfig(format!(
                    "unknown embedding provider: {}",
                    other
                )))
            }
        };

        let dims = match provider {
            Provider::Hashed => config.dims.unwrap_or(HASHED_DEFAULT_DIMS),
            _ => config.dims.ok_or_else(|| {
                Error::FatalConfig("embedding.dims is required for remote providers".to_string())
            })?,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::FatalConfig(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            provider,
            model: config.model.clone().unwrap_or_else(|| "hashed".to_string()),
            dims,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            url: config.url.clone(),
            client,
            limiter: Arc::new(Semaphore::new(config.parallelism.max(1))),
            counters: Arc::new(EmbedCounters::default()),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// Fixed vector dimension for both tiers.
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn counters(&self) -> &EmbedCounters {
        &self.counters
    }

    /// Embed a batch of texts, order-preserving.
    ///
    /// Returns one unit-normalised vector of [`Self::dims`] per input text.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        // Blank inputs short-circuit to the zero vector.
        let live: Vec<usize> = texts
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                if t.trim().is_empty() {
                    slots[i] = Some(vec![0.0; self.dims]);
                    None
                } else {
                    Some(i)
                }
            })
            .collect();

        if live.is_empty() {
            return Ok(vec![vec![0.0; self.dims]; texts.len()]);
        }

        let mut join: JoinSet<(Vec<usize>, Result<Vec<Vec<f32>>>)> = JoinSet::new();
        for batch_indices in live.chunks(self.batch_size) {
            let indices: Vec<usize> = batch_indices.to_vec();
            let batch: Vec<String> = indices.iter().map(|&i| texts[i].clone()).collect();
            let this = self.clone();
            join.spawn(async move {
                let _permit = match this.limiter.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            indices,
                            Err(Error::Internal("embedding limiter closed".to_string())),
                        )
                    }
                };
                let result = this.call_batch_with_retry(&batch, indices[0]).await;
                (indices, result)
            });
        }

        let mut worst: Option<Error> = None;
        while let Some(joined) = join.join_next().await {
            let (indices, result) = joined
                .map_err(|e| Error::Internal(format!("embedding task panicked: {}", e)))?;
            match result {
                Ok(vectors) => {
                    for (slot, vector) in indices.into_iter().zip(vectors) {
                        slots[slot] = Some(vector);
                    }
                }
                Err(err) => worst = Some(more_severe(worst.take(), err)),
            }
        }

        if let Some(err) = worst {
            return Err(err);
        }

        slots
            .into_iter()
            .map(|s| s.ok_or_else(|| Error::Internal("embedding slot left unfilled".to_string())))
            .collect()
    }

    /// Embed a single text (e.g. a search query).
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Internal("empty embedding response".to_string()))
    }

    async fn call_batch_with_retry(
        &self,
        batch: &[String],
        first_index: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.call_batch(batch, first_index).await {
                Ok(vectors) => {
                    self.counters
                        .last_success_unix
                        .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                    return Ok(vectors);
                }
                Err(err) => {
                    self.counters.record_failure(&err);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Transient("embedding failed after retries".to_string())))
    }

    async fn call_batch(&self, batch: &[String], first_index: usize) -> Result<Vec<Vec<f32>>> {
        let raw = match self.provider {
            Provider::Hashed => batch.iter().map(|t| hashed_embedding(t, self.dims)).collect(),
            Provider::OpenAi => self.call_openai(batch, first_index).await?,
            Provider::Ollama => self.call_ollama(batch, first_index).await?,
        };

        let mut vectors = Vec::with_capacity(raw.len());
        for mut vector in raw {
            if vector.len() != self.dims {
                return Err(Error::FatalConfig(format!(
                    "provider returned dimension {} but {} is configured",
                    vector.len(),
                    self.dims
                )));
            }
            l2_normalize(&mut vector);
            vectors.push(vector);
        }

        if vectors.len() != batch.len() {
            return Err(Error::Transient(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }

        Ok(vectors)
    }

    async fn call_openai(&self, batch: &[String], first_index: usize) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::FatalConfig("OPENAI_API_KEY not set".to_string()))?;

        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                status.as_u16(),
                &format!("OpenAI API error {}: {}", status, text),
                first_index,
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("OpenAI response unreadable: {}", e)))?;

        if let Some(tokens) = json.pointer("/usage/total_tokens").and_then(|v| v.as_u64()) {
            self.counters
                .tokens_consumed
                .fetch_add(tokens, Ordering::Relaxed);
        }

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Transient("OpenAI response missing data array".to_string()))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    Error::Transient("OpenAI response missing embedding".to_string())
                })?;
            embeddings.push(
                embedding
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect(),
            );
        }
        Ok(embeddings)
    }

    async fn call_ollama(&self, batch: &[String], first_index: usize) -> Result<Vec<Vec<f32>>> {
        let url = self.url.as_deref().unwrap_or("http://localhost:11434");

        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let body = serde_json::json!({
            "model": self.model,
            "input": batch,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(
                status.as_u16(),
                &format!("Ollama API error {}: {}", status, text),
                first_index,
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("Ollama response unreadable: {}", e)))?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                Error::Transient("Ollama response missing embeddings array".to_string())
            })?;

        let mut out = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let vector: Vec<f32> = embedding
                .as_array()
                .ok_or_else(|| Error::Transient("Ollama embedding is not an array".to_string()))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            out.push(vector);
        }
        Ok(out)
    }
}

/// Map an HTTP failure status to an error kind.
fn classify_http_failure(status: u16, message: &str, first_index: usize) -> Error {
    match status {
        401 | 403 => Error::FatalConfig(message.to_string()),
        429 => Error::Transient(message.to_string()),
        s if s >= 500 => Error::Transient(message.to_string()),
        _ => Error::invalid_fields(
            message.to_string(),
            vec![crate::error::FieldError::new(
                format!("texts[{}]", first_index),
                "rejected by embedding provider",
            )],
        ),
    }
}

/// Deterministic feature-hash embedding: each lowercased token is hashed to
/// a signed bucket. Blank text yields the all-zero vector.
fn hashed_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let bucket = u64::from_le_bytes(bytes) as usize % dims;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
    vector
}

/// Scale a vector to unit length. The zero vector is left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity between two vectors; with unit-normalised inputs this
/// is just the dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Pick the more severe of two errors: fatal > invalid input > transient.
fn more_severe(current: Option<Error>, new: Error) -> Error {
    fn rank(e: &Error) -> u8 {
        match e {
            Error::FatalConfig(_) => 3,
            Error::InvalidInput { .. } => 2,
            Error::Transient(_) => 1,
            _ => 0,
        }
    }
    match current {
        Some(old) if rank(&old) >= rank(&new) => old,
        _ => new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    fn hashed_embedder(dims: usize) -> Embedder {
        Embedder::new(&EmbeddingConfig {
            provider: "hashed".to_string(),
            dims: Some(dims),
            ..EmbeddingConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn hashed_provider_is_deterministic_and_unit_length() {
        let embedder = hashed_embedder(64);
        let a = embedder.embed_one("user login flow").await.unwrap();
        let b = embedder.embed_one("user login flow").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn blank_text_maps_to_zero_vector() {
        let embedder = hashed_embedder(32);
        let vectors = embedder
            .embed(&["   ".to_string(), "real text".to_string()])
            .await
            .unwrap();
        assert!(vectors[0].iter().all(|&v| v == 0.0));
        assert!(vectors[1].iter().any(|&v| v != 0.0));
    }

    #[tokio::test]
    async fn embed_preserves_input_order_across_batches() {
        let config = EmbeddingConfig {
            provider: "hashed".to_string(),
            dims: Some(32),
            batch_size: 2,
            parallelism: 4,
            ..EmbeddingConfig::default()
        };
        let embedder = Embedder::new(&config).unwrap();

        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        let batched = embedder.embed(&texts).await.unwrap();

        for (text, vector) in texts.iter().zip(&batched) {
            let single = embedder.embed_one(text).await.unwrap();
            assert_eq!(&single, vector, "order broken for {:?}", text);
        }
    }

    #[tokio::test]
    async fn shared_tokens_score_higher_than_disjoint() {
        let embedder = hashed_embedder(128);
        let query = embedder.embed_one("user login").await.unwrap();
        let related = embedder.embed_one("login page loads").await.unwrap();
        let unrelated = embedder.embed_one("reset password").await.unwrap();

        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated),
            "token overlap should raise similarity"
        );
    }

    #[test]
    fn unknown_provider_is_fatal() {
        let err = Embedder::new(&EmbeddingConfig {
            provider: "vertex".to_string(),
            ..EmbeddingConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), "fatal_config");
    }

    #[test]
    fn http_classification() {
        assert_eq!(classify_http_failure(401, "x", 0).kind(), "fatal_config");
        assert_eq!(classify_http_failure(403, "x", 0).kind(), "fatal_config");
        assert_eq!(classify_http_failure(429, "x", 0).kind(), "transient");
        assert_eq!(classify_http_failure(503, "x", 0).kind(), "transient");
        assert_eq!(classify_http_failure(400, "x", 3).kind(), "invalid_input");
    }

    #[test]
    fn severity_ordering_prefers_fatal() {
        let worst = more_severe(
            Some(Error::Transient("t".into())),
            Error::FatalConfig("f".into()),
        );
        assert_eq!(worst.kind(), "fatal_config");

        let worst = more_severe(
            Some(Error::FatalConfig("f".into())),
            Error::Transient("t".into()),
        );
        assert_eq!(worst.kind(), "fatal_config");
    }

    #[test]
    fn l2_normalize_leaves_zero_vector() {
        let mut zero = vec![0.0f32; 4];
        l2_normalize(&mut zero);
        assert!(zero.iter().all(|&v| v == 0.0));
    }
}
