//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: raw records → normalisation → batch embedding
//! → two-tier upsert, with durable checkpoints and resume.
//!
//! # Pipeline
//!
//! 1. **Chunk** the record stream into groups of `ingest.chunk_size`.
//! 2. **Normalise** each record; invalid records are skipped with a warning,
//!    never aborting the run.
//! 3. **Embed** each chunk's doc texts and step texts in two provider calls
//!    (the provider sub-batches internally). Up to `ingest.parallelism`
//!    chunks embed concurrently; each chunk has its own deadline.
//! 4. **Upsert** chunk results strictly in chunk order, per uid inside a
//!    keyed critical section: one store transaction deletes the old steps,
//!    upserts the doc, and inserts the new steps, so each uid is either
//!    fully replaced or left untouched.
//! 5. **Checkpoint** after every chunk with an atomic write-then-rename, so
//!    a restart skips completed chunks and re-runs only deferred ones.
//!
//! # Failure policy
//!
//! - Invalid record → skipped, counted, warned.
//! - Chunk embedding or upsert failure after retries → the chunk lands in
//!   the checkpoint's deferred set and is retried once at the end.
//! - Fatal configuration errors abort the run with a consistent checkpoint.
//!
//! # Backpressure
//!
//! A deferred chunk caused by throttling halves the number of chunks in
//! flight; after three consecutive successes the configured parallelism is
//! restored.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::{IngestReport, TestDoc};
use crate::normalize;
use crate::store::VectorStore;

/// Consecutive successful chunks before throttled parallelism is restored.
const RESTORE_AFTER_SUCCESSES: u32 = 3;

// ============ Checkpoint ============

/// Durable record of ingestion progress for one source.
///
/// `last_chunk_completed` is the highest chunk index that has been handled
/// (written or deferred); everything at or below it is skipped on resume,
/// except the chunks listed in `deferred_chunks`, which are re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    /// -1 when no chunk has completed yet.
    pub last_chunk_completed: i64,
    pub deferred_chunks: Vec<usize>,
    pub counters: CheckpointCounters,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointCounters {
    pub docs_in: u64,
    pub docs_written: u64,
    pub steps_written: u64,
    pub skipped: u64,
}

impl Checkpoint {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            last_chunk_completed: -1,
            deferred_chunks: Vec::new(),
            counters: CheckpointCounters::default(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Load a checkpoint for this source. A missing, unreadable, or
    /// foreign-source file means a fresh start.
    pub fn load(path: &Path, source_id: &str) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).ok()?;
        if checkpoint.source_id == source_id {
            Some(checkpoint)
        } else {
            None
        }
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// target. A crash mid-write never corrupts the previous checkpoint.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("cannot create checkpoint dir: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("cannot serialise checkpoint: {}", e)))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| Error::Internal(format!("cannot write checkpoint: {}", e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| Error::Internal(format!("cannot commit checkpoint: {}", e)))?;
        Ok(())
    }

    /// Remove the checkpoint after a fully successful run, so the next run
    /// of the same source re-ingests from scratch.
    pub fn clear(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

// ============ Per-uid critical section ============

/// Keyed mutex map: concurrent ingestion of the *same* uid serialises, while
/// different uids proceed independently. Entries live for the lifetime of
/// the process.
#[derive(Default)]
pub struct UidLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UidLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, uid: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(uid.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

// ============ Source reading ============

/// Read raw records from a JSON file: a top-level array, or an object
/// wrapping one under `rows`, `tests`, or `records`.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid(format!("cannot read {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| Error::invalid(format!("{} is not valid JSON: {}", path.display(), e)))?;

    match value {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => {
            for key in ["rows", "tests", "records"] {
                if let Some(Value::Array(records)) = map.remove(key) {
                    return Ok(records);
                }
            }
            Err(Error::invalid(format!(
                "{} contains no record array (expected a top-level array or a rows/tests/records field)",
                path.display()
            )))
        }
        _ => Err(Error::invalid(format!(
            "{} contains no record array",
            path.display()
        ))),
    }
}

// ============ Pipeline ============

/// One normalised document with its embeddings, ready to upsert.
struct PreparedDoc {
    doc: TestDoc,
    doc_vector: Vec<f32>,
    step_vectors: Vec<Vec<f32>>,
}

/// Output of the embed stage for one chunk.
struct EmbeddedChunk {
    docs: Vec<PreparedDoc>,
    warnings: Vec<String>,
    records_in: u64,
    skipped: u64,
}

/// The ingestion pipeline. Cheap to clone; clones share the store pool, the
/// embedding client, and the uid lock map.
#[derive(Clone)]
pub struct Ingestor {
    store: VectorStore,
    embedder: Embedder,
    config: IngestConfig,
    locks: Arc<UidLocks>,
}

impl Ingestor {
    pub fn new(
        store: VectorStore,
        embedder: Embedder,
        config: IngestConfig,
        locks: Arc<UidLocks>,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            locks,
        }
    }

    /// Ingest a record stream under the given source id.
    ///
    /// Idempotent: re-running over the same source converges to the same
    /// store state no matter how many times any chunk was attempted.
    pub async fn run(&self, source_id: &str, records: Vec<Value>) -> Result<IngestReport> {
        let chunk_size = self.config.chunk_size;
        let total_chunks = records.len().div_ceil(chunk_size);
        let records = Arc::new(records);

        let mut checkpoint = Checkpoint::load(&self.config.checkpoint_path, source_id)
            .unwrap_or_else(|| Checkpoint::new(source_id));

        // Work list: previously deferred chunks first, then everything past
        // the checkpoint, ascending.
        let mut work: Vec<usize> = checkpoint
            .deferred_chunks
            .iter()
            .copied()
            .filter(|&i| i < total_chunks)
            .collect();
        let resume_from = (checkpoint.last_chunk_completed + 1).max(0) as usize;
        work.extend(resume_from..total_chunks);
        work.sort_unstable();
        work.dedup();

        if checkpoint.last_chunk_completed >= 0 {
            info!(
                source = source_id,
                resume_from,
                deferred = checkpoint.deferred_chunks.len(),
                "resuming ingestion from checkpoint"
            );
        }

        let mut report = IngestReport {
            docs_in: checkpoint.counters.docs_in,
            docs_written: checkpoint.counters.docs_written,
            steps_written: checkpoint.counters.steps_written,
            skipped: checkpoint.counters.skipped,
            ..IngestReport::default()
        };

        let configured_parallelism = self.config.parallelism.max(1);
        let mut effective_parallelism = configured_parallelism;
        let mut consecutive_successes = 0u32;

        let mut join: JoinSet<(usize, Result<EmbeddedChunk>)> = JoinSet::new();
        let mut ready: BTreeMap<usize, Result<EmbeddedChunk>> = BTreeMap::new();
        let mut spawned = 0usize;
        let mut written = 0usize;

        while written < work.len() {
            // Keep up to `effective_parallelism` chunks embedding.
            while spawned < work.len() && spawned - written - ready.len() < effective_parallelism {
                let position = spawned;
                let chunk_index = work[position];
                let this = self.clone();
                let records = Arc::clone(&records);
                let source = source_id.to_string();
                join.spawn(async move {
                    let start = chunk_index * chunk_size;
                    let end = (start + chunk_size).min(records.len());
                    let outcome = this.embed_chunk(&records[start..end], &source).await;
                    (position, outcome)
                });
                spawned += 1;
            }

            if let Some(joined) = join.join_next().await {
                let (position, outcome) = joined
                    .map_err(|e| Error::Internal(format!("ingest task panicked: {}", e)))?;
                ready.insert(position, outcome);
            }

            // Drain completed chunks strictly in work-list order so the
            // checkpoint only ever advances over finished ground.
            while let Some(outcome) = ready.remove(&written) {
                let chunk_index = work[written];
                let was_deferred = checkpoint.deferred_chunks.contains(&chunk_index);

                let chunk_failure = match outcome {
                    Ok(embedded) => match self.write_chunk(&embedded).await {
                        // Counters only move once the whole chunk has landed,
                        // so a deferred retry never double-counts.
                        Ok((docs_written, steps_written)) => {
                            merge_chunk(&mut report, &embedded, docs_written, steps_written);
                            None
                        }
                        Err(err @ Error::FatalConfig(_)) => {
                            self.flush_checkpoint(&mut checkpoint, &report)?;
                            return Err(err);
                        }
                        Err(err) => Some(err),
                    },
                    Err(err @ Error::FatalConfig(_)) => {
                        self.flush_checkpoint(&mut checkpoint, &report)?;
                        return Err(err);
                    }
                    Err(err) => Some(err),
                };

                match chunk_failure {
                    None => {
                        if was_deferred {
                            checkpoint.deferred_chunks.retain(|&i| i != chunk_index);
                        }
                        consecutive_successes += 1;
                        if consecutive_successes >= RESTORE_AFTER_SUCCESSES {
                            effective_parallelism = configured_parallelism;
                        }
                    }
                    Some(err) => {
                        warn!(chunk = chunk_index, error = %err, "chunk deferred");
                        if !was_deferred {
                            checkpoint.deferred_chunks.push(chunk_index);
                        }
                        if err.is_transient() {
                            effective_parallelism = (effective_parallelism / 2).max(1);
                            consecutive_successes = 0;
                        }
                    }
                }

                checkpoint.last_chunk_completed =
                    checkpoint.last_chunk_completed.max(chunk_index as i64);
                self.flush_checkpoint(&mut checkpoint, &report)?;
                written += 1;
            }
        }

        // One end-of-run retry for everything still deferred.
        let deferred: Vec<usize> = checkpoint.deferred_chunks.clone();
        for chunk_index in deferred {
            let start = chunk_index * chunk_size;
            let end = (start + chunk_size).min(records.len());
            let retried = match self.embed_chunk(&records[start..end], source_id).await {
                Ok(embedded) => self.write_chunk(&embedded).await.map(
                    |(docs_written, steps_written)| {
                        merge_chunk(&mut report, &embedded, docs_written, steps_written);
                    },
                ),
                Err(err) => Err(err),
            };
            match retried {
                Ok(()) => {
                    checkpoint.deferred_chunks.retain(|&i| i != chunk_index);
                    self.flush_checkpoint(&mut checkpoint, &report)?;
                }
                Err(err @ Error::FatalConfig(_)) => {
                    self.flush_checkpoint(&mut checkpoint, &report)?;
                    return Err(err);
                }
                Err(err) => {
                    report
                        .errors
                        .push(format!("chunk {} failed permanently: {}", chunk_index, err));
                    self.flush_checkpoint(&mut checkpoint, &report)?;
                }
            }
        }

        if checkpoint.deferred_chunks.is_empty() {
            Checkpoint::clear(&self.config.checkpoint_path);
        }

        info!(
            source = source_id,
            docs_in = report.docs_in,
            docs_written = report.docs_written,
            steps_written = report.steps_written,
            skipped = report.skipped,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Normalise and embed one chunk under its deadline.
    async fn embed_chunk(&self, records: &[Value], source_id: &str) -> Result<EmbeddedChunk> {
        let deadline = Duration::from_secs(self.config.chunk_timeout_secs);
        tokio::time::timeout(deadline, self.embed_chunk_inner(records, source_id))
            .await
            .map_err(|_| {
                Error::Transient(format!(
                    "chunk embedding exceeded {}s deadline",
                    self.config.chunk_timeout_secs
                ))
            })?
    }

    async fn embed_chunk_inner(&self, records: &[Value], source_id: &str) -> Result<EmbeddedChunk> {
        let now = Utc::now();
        let mut warnings = Vec::new();
        let mut skipped = 0u64;
        let mut docs = Vec::with_capacity(records.len());

        for (i, raw) in records.iter().enumerate() {
            match normalize::normalize(raw, source_id, now) {
                Ok((doc, mut doc_warnings)) => {
                    warnings.append(&mut doc_warnings);
                    docs.push(doc);
                }
                Err(err) => {
                    skipped += 1;
                    warnings.push(format!("record {} skipped: {}", i, err));
                }
            }
        }

        // Two flat embed calls per chunk; the provider sub-batches.
        let doc_texts: Vec<String> = docs.iter().map(TestDoc::embedding_text).collect();
        let step_texts: Vec<String> = docs
            .iter()
            .flat_map(|d| d.steps.iter().map(|s| s.embedding_text()))
            .collect();

        let doc_vectors = self.embedder.embed(&doc_texts).await?;
        let step_vectors = self.embedder.embed(&step_texts).await?;

        let mut step_cursor = 0usize;
        let prepared = docs
            .into_iter()
            .zip(doc_vectors)
            .map(|(doc, doc_vector)| {
                let n_steps = doc.steps.len();
                let step_vectors = step_vectors[step_cursor..step_cursor + n_steps].to_vec();
                step_cursor += n_steps;
                PreparedDoc {
                    doc,
                    doc_vector,
                    step_vectors,
                }
            })
            .collect();

        Ok(EmbeddedChunk {
            docs: prepared,
            warnings,
            records_in: records.len() as u64,
            skipped,
        })
    }

    /// Upsert one chunk's documents, each inside its uid critical section
    /// and a single store transaction, so a failed replace leaves the
    /// previous version of the document intact.
    /// Returns `(docs_written, steps_written)` for the whole chunk.
    async fn write_chunk(&self, chunk: &EmbeddedChunk) -> Result<(u64, u64)> {
        let mut docs_written = 0u64;
        let mut steps_written = 0u64;

        for prepared in &chunk.docs {
            let _guard = self.locks.lock(&prepared.doc.uid).await;

            let steps: Vec<_> = prepared
                .doc
                .steps
                .iter()
                .cloned()
                .zip(prepared.step_vectors.iter().cloned())
                .collect();
            self.store
                .replace_doc(&prepared.doc, &prepared.doc_vector, &steps)
                .await?;

            docs_written += 1;
            steps_written += steps.len() as u64;
        }
        Ok((docs_written, steps_written))
    }

    fn flush_checkpoint(&self, checkpoint: &mut Checkpoint, report: &IngestReport) -> Result<()> {
        checkpoint.counters = CheckpointCounters {
            docs_in: report.docs_in,
            docs_written: report.docs_written,
            steps_written: report.steps_written,
            skipped: report.skipped,
        };
        checkpoint.save(&self.config.checkpoint_path)
    }
}

/// Fold one fully-written chunk into the running report.
fn merge_chunk(
    report: &mut IngestReport,
    embedded: &EmbeddedChunk,
    docs_written: u64,
    steps_written: u64,
) {
    report.docs_in += embedded.records_in;
    report.skipped += embedded.skipped;
    report.warnings.extend(embedded.warnings.iter().cloned());
    report.docs_written += docs_written;
    report.steps_written += steps_written;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkpoint_roundtrip_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let mut checkpoint = Checkpoint::new("xray");
        checkpoint.last_chunk_completed = 4;
        checkpoint.deferred_chunks = vec![2];
        checkpoint.counters.docs_written = 2000;
        checkpoint.save(&path).unwrap();

        // Temp file must not linger after a successful save.
        assert!(!path.with_extension("tmp").exists());

        let loaded = Checkpoint::load(&path, "xray").unwrap();
        assert_eq!(loaded.last_chunk_completed, 4);
        assert_eq!(loaded.deferred_chunks, vec![2]);
        assert_eq!(loaded.counters.docs_written, 2000);
    }

    #[test]
    fn checkpoint_for_other_source_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");

        Checkpoint::new("alpha").save(&path).unwrap();
        assert!(Checkpoint::load(&path, "beta").is_none());
        assert!(Checkpoint::load(&path, "alpha").is_some());
    }

    #[test]
    fn checkpoint_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        Checkpoint::new("src").save(&path).unwrap();
        Checkpoint::clear(&path);
        assert!(!path.exists());
        // Clearing a missing file is a no-op.
        Checkpoint::clear(&path);
    }

    #[test]
    fn read_records_accepts_array_and_wrapped_shapes() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("plain.json");
        std::fs::write(&plain, r#"[{"title": "a"}, {"title": "b"}]"#).unwrap();
        assert_eq!(read_records(&plain).unwrap().len(), 2);

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(&wrapped, r#"{"rows": [{"title": "a"}]}"#).unwrap();
        assert_eq!(read_records(&wrapped).unwrap().len(), 1);

        let tests = dir.path().join("tests.json");
        std::fs::write(&tests, r#"{"tests": []}"#).unwrap();
        assert!(read_records(&tests).unwrap().is_empty());
    }

    #[test]
    fn read_records_rejects_non_array_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"data": 42}"#).unwrap();
        assert!(read_records(&bad).is_err());

        let scalar = dir.path().join("scalar.json");
        std::fs::write(&scalar, "17").unwrap();
        assert!(read_records(&scalar).is_err());

        assert!(read_records(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn uid_locks_serialise_same_uid() {
        let locks = Arc::new(UidLocks::new());

        let guard = locks.lock("T-1").await;
        // Same uid: must block while the guard is held.
        let contended = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("T-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contended.is_finished(), "same-uid lock should block");

        // Different uid: proceeds immediately.
        let _other = locks.lock("T-2").await;

        drop(guard);
        contended.await.unwrap();
    }

    #[tokio::test]
    async fn embed_chunk_skips_invalid_records() {
        let embedder = Embedder::new(&crate::config::EmbeddingConfig {
            provider: "hashed".to_string(),
            dims: Some(32),
            ..crate::config::EmbeddingConfig::default()
        })
        .unwrap();
        // The store is never touched by embed_chunk; a lazy pool is enough.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/never-used")
            .unwrap();
        let ingestor = Ingestor::new(
            VectorStore::new(pool),
            embedder,
            IngestConfig::default(),
            Arc::new(UidLocks::new()),
        );

        let records = vec![
            json!({"title": "valid test", "steps": [{"action": "do it"}]}),
            json!({"nope": true}),
            json!(42),
        ];
        let chunk = ingestor.embed_chunk(&records, "unit").await.unwrap();
        assert_eq!(chunk.records_in, 3);
        assert_eq!(chunk.skipped, 2);
        assert_eq!(chunk.docs.len(), 1);
        assert_eq!(chunk.docs[0].step_vectors.len(), 1);
        assert!(chunk.warnings.iter().any(|w| w.contains("skipped")));
    }
}
