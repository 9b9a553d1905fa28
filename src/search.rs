//! Hybrid retrieval engine.
//!
//! A search embeds the query once, fans out concurrently to the doc tier
//! and the step tier, rolls step hits up to their parent documents, fuses
//! the two scores linearly, and returns a single deterministic ranking with
//! matched step indices annotated.
//!
//! ```text
//!                 ┌── KnnDocs(qvec, k) ─────────┐
//! query ─ embed ──┤                             ├─ rollup ─ fuse ─ rank ─ hydrate
//!                 └── KnnSteps(qvec, k·OF) ─────┘
//! ```
//!
//! # Score fusion
//!
//! With configurable weights `doc_weight` + `step_weight` = 1:
//!
//! - uid in both tiers: `final = doc_weight · s_doc + step_weight · s_step*`
//! - doc tier only: `final = doc_weight · s_doc`
//! - step rollup only: `final = step_weight · s_step*`
//!
//! where `s_step*` is the best step score of the parent. Ties break by uid
//! ascending, then best step index ascending, so identical store state and
//! query always produce identical output.
//!
//! If one fan-out branch fails while the other succeeds, the survivor's
//! results are returned with a soft warning instead of an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::filter::{CompiledFilter, SearchFilters};
use crate::models::{SearchHit, TestDoc};
use crate::store::{DocHit, StepHit, VectorStore};

/// Upper bound on matches considered during direct external-key lookup.
const LOOKUP_LIMIT: usize = 16;

/// Which tiers a search consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    All,
    Docs,
    Steps,
}

impl std::str::FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Scope::All),
            "docs" => Ok(Scope::Docs),
            "steps" => Ok(Scope::Steps),
            other => Err(Error::invalid(format!(
                "unknown scope: '{}' (expected all, docs, or steps)",
                other
            ))),
        }
    }
}

/// Result of one search: ranked hits plus an optional degradation warning
/// when a fan-out branch failed.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The retrieval engine. Holds shared handles only; all state lives in the
/// store and the embedding provider.
#[derive(Clone)]
pub struct SearchEngine {
    store: VectorStore,
    embedder: Embedder,
    retrieval: RetrievalConfig,
}

impl SearchEngine {
    pub fn new(store: VectorStore, embedder: Embedder, retrieval: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            retrieval,
        }
    }

    /// Single-query semantic search.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: &SearchFilters,
        scope: Scope,
    ) -> Result<SearchOutcome> {
        if query.trim().is_empty() {
            return Err(Error::invalid("query must not be empty"));
        }
        if query.len() > self.retrieval.max_query_bytes {
            return Err(Error::invalid(format!(
                "query exceeds {} bytes",
                self.retrieval.max_query_bytes
            )));
        }
        let top_k = self.validated_top_k(top_k)?;
        let compiled = filters.compile()?;

        let qvec = self.embedder.embed_one(query).await?;
        self.run_from_vector(&qvec, top_k, &compiled, scope, None)
            .await
    }

    /// "Find tests similar to X": reuse X's stored doc vector as the query,
    /// excluding X itself from the ranking. The reference may be a uid or a
    /// (unique) external key.
    pub async fn similar(
        &self,
        reference: &str,
        top_k: Option<usize>,
        scope: Scope,
    ) -> Result<SearchOutcome> {
        if reference.trim().is_empty() {
            return Err(Error::invalid("reference must not be empty"));
        }
        let top_k = self.validated_top_k(top_k)?;

        let (uid, qvec) = match self.store.fetch_doc_vector(reference).await? {
            Some(vector) => (reference.to_string(), vector),
            None => {
                let matches = self
                    .store
                    .fetch_by_external_key(reference, LOOKUP_LIMIT)
                    .await?;
                match matches.len() {
                    0 => {
                        return Err(Error::NotFound(format!(
                            "no test with uid or external key '{}'",
                            reference
                        )))
                    }
                    1 => {
                        let uid = matches[0].uid.clone();
                        let vector = self.store.fetch_doc_vector(&uid).await?.ok_or_else(|| {
                            Error::NotFound(format!("test '{}' has no stored vector", uid))
                        })?;
                        (uid, vector)
                    }
                    n => {
                        return Err(Error::Conflict(format!(
                            "external key '{}' matches {} tests; use a uid",
                            reference, n
                        )))
                    }
                }
            }
        };

        let compiled = CompiledFilter::default();
        self.run_from_vector(&qvec, top_k, &compiled, scope, Some(&uid))
            .await
    }

    /// Direct lookup by external key. Exactly one match or an error.
    pub async fn lookup_by_key(&self, key: &str) -> Result<TestDoc> {
        if key.trim().is_empty() {
            return Err(Error::invalid("external_key must not be empty"));
        }
        let mut matches = self.store.fetch_by_external_key(key, LOOKUP_LIMIT).await?;
        match matches.len() {
            0 => Err(Error::NotFound(format!(
                "no test with external key '{}'",
                key
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::Conflict(format!(
                "external key '{}' matches {} tests",
                key, n
            ))),
        }
    }

    fn validated_top_k(&self, top_k: Option<usize>) -> Result<usize> {
        let top_k = top_k.unwrap_or(self.retrieval.default_top_k);
        if !(1..=100).contains(&top_k) {
            return Err(Error::invalid(format!(
                "top_k must be in 1..=100 (got {})",
                top_k
            )));
        }
        Ok(top_k)
    }

    /// Steps 3–8 of the search algorithm, shared by `search` and `similar`.
    async fn run_from_vector(
        &self,
        qvec: &[f32],
        top_k: usize,
        filter: &CompiledFilter,
        scope: Scope,
        exclude_uid: Option<&str>,
    ) -> Result<SearchOutcome> {
        let k_step = (top_k * self.retrieval.overfetch).min(self.retrieval.max_candidates);

        // Concurrent fan-out; a tier outside the scope resolves to empty.
        let (doc_result, step_result) = tokio::join!(
            async {
                match scope {
                    Scope::Steps => Ok(Vec::new()),
                    _ => self.store.knn_docs(qvec, top_k, filter).await,
                }
            },
            async {
                match scope {
                    Scope::Docs => Ok(Vec::new()),
                    _ => self.store.knn_steps(qvec, k_step, filter).await,
                }
            },
        );

        // Partial-failure degradation: keep the surviving branch, attach a
        // soft warning. Only fail when nothing survived.
        let mut warning = None;
        let mut step_tier_ok = true;
        let (doc_hits, step_hits) = match (doc_result, step_result) {
            (Ok(docs), Ok(steps)) => (docs, steps),
            (Ok(docs), Err(err)) if scope != Scope::Steps => {
                warn!(error = %err, "step-tier fan-out failed, degrading to doc tier");
                warning = Some(format!("step tier unavailable: {}", err));
                step_tier_ok = false;
                (docs, Vec::new())
            }
            (Err(err), Ok(steps)) if scope != Scope::Docs => {
                warn!(error = %err, "doc-tier fan-out failed, degrading to step tier");
                warning = Some(format!("doc tier unavailable: {}", err));
                (Vec::new(), steps)
            }
            (Err(err), _) => return Err(err),
            (_, Err(err)) => return Err(err),
        };

        let rollup = rollup_steps(&step_hits);
        let ranked = fuse_and_rank(
            doc_hits,
            rollup,
            FusionWeights::for_scope(scope, &self.retrieval),
            exclude_uid,
            top_k,
        );

        // When the step tier is down, skip step hydration too: degraded
        // results carry empty step lists rather than failing outright.
        let hits = self.hydrate(ranked, step_tier_ok).await?;
        Ok(SearchOutcome { hits, warning })
    }

    /// Attach full document payloads: knn-provided payloads get their steps
    /// filled in; rollup-only uids are batch-fetched.
    async fn hydrate(&self, ranked: Vec<FusedHit>, include_steps: bool) -> Result<Vec<SearchHit>> {
        let missing: Vec<String> = ranked
            .iter()
            .filter(|h| h.doc.is_none())
            .map(|h| h.uid.clone())
            .collect();
        let fetched: HashMap<String, TestDoc> = self
            .store
            .fetch_docs_by_uids(&missing)
            .await?
            .into_iter()
            .map(|d| (d.uid.clone(), d))
            .collect();

        let with_payload: Vec<String> = if include_steps {
            ranked
                .iter()
                .filter(|h| h.doc.is_some())
                .map(|h| h.uid.clone())
                .collect()
        } else {
            Vec::new()
        };
        let steps = self.store.fetch_steps_by_parents(&with_payload).await?;

        let mut hits = Vec::with_capacity(ranked.len());
        for fused in ranked {
            let doc = match fused.doc {
                Some(mut doc) => {
                    doc.steps = steps.get(&fused.uid).cloned().unwrap_or_default();
                    doc
                }
                None => match fetched.get(&fused.uid) {
                    Some(doc) => doc.clone(),
                    // Deleted between fan-out and hydration; drop the hit.
                    None => continue,
                },
            };
            hits.push(SearchHit {
                uid: fused.uid,
                score: fused.score,
                matched_step_indices: fused.matched_step_indices,
                doc,
            });
        }
        Ok(hits)
    }
}

/// Effective fusion weights after applying the scope variant.
#[derive(Debug, Clone, Copy)]
struct FusionWeights {
    doc: f64,
    step: f64,
}

impl FusionWeights {
    fn for_scope(scope: Scope, retrieval: &RetrievalConfig) -> Self {
        match scope {
            Scope::All => Self {
                doc: retrieval.doc_weight,
                step: retrieval.step_weight,
            },
            // Scope variants use the raw tier score.
            Scope::Docs => Self { doc: 1.0, step: 0.0 },
            Scope::Steps => Self { doc: 0.0, step: 1.0 },
        }
    }
}

/// Per-parent aggregate of step hits.
#[derive(Debug, Clone, PartialEq)]
struct StepRollup {
    best_score: f64,
    best_index: u32,
    indices: Vec<u32>,
}

/// Group step hits by parent uid, tracking the best score, the best step
/// index, and all contributing indices (ascending).
fn rollup_steps(step_hits: &[StepHit]) -> HashMap<String, StepRollup> {
    let mut rollup: HashMap<String, StepRollup> = HashMap::new();
    for hit in step_hits {
        let entry = rollup
            .entry(hit.parent_uid.clone())
            .or_insert_with(|| StepRollup {
                best_score: hit.score,
                best_index: hit.index,
                indices: Vec::new(),
            });
        if hit.score > entry.best_score
            || (hit.score == entry.best_score && hit.index < entry.best_index)
        {
            entry.best_score = hit.score;
            entry.best_index = hit.index;
        }
        if !entry.indices.contains(&hit.index) {
            entry.indices.push(hit.index);
        }
    }
    for entry in rollup.values_mut() {
        entry.indices.sort_unstable();
    }
    rollup
}

/// One fused candidate before hydration.
#[derive(Debug, Clone)]
struct FusedHit {
    uid: String,
    score: f64,
    /// Best contributing step index; `u32::MAX` when only the doc tier hit.
    best_step_index: u32,
    matched_step_indices: Vec<u32>,
    doc: Option<TestDoc>,
}

/// Linear score fusion, deterministic ranking, and truncation.
///
/// Pure so the merge semantics are testable without a store.
fn fuse_and_rank(
    doc_hits: Vec<DocHit>,
    mut rollup: HashMap<String, StepRollup>,
    weights: FusionWeights,
    exclude_uid: Option<&str>,
    top_k: usize,
) -> Vec<FusedHit> {
    let mut fused: Vec<FusedHit> = Vec::with_capacity(doc_hits.len() + rollup.len());

    for hit in doc_hits {
        let (score, best_step_index, matched) = match rollup.remove(&hit.uid) {
            Some(steps) => (
                weights.doc * hit.score + weights.step * steps.best_score,
                steps.best_index,
                steps.indices,
            ),
            None if weights.doc == 0.0 => continue,
            None => (weights.doc * hit.score, u32::MAX, Vec::new()),
        };
        fused.push(FusedHit {
            uid: hit.uid,
            score,
            best_step_index,
            matched_step_indices: matched,
            doc: Some(hit.doc),
        });
    }

    // Parents that only surfaced on the step tier. A zero-weighted tier
    // cannot introduce candidates of its own.
    for (uid, steps) in rollup {
        if weights.step == 0.0 {
            continue;
        }
        fused.push(FusedHit {
            uid,
            score: weights.step * steps.best_score,
            best_step_index: steps.best_index,
            matched_step_indices: steps.indices,
            doc: None,
        });
    }

    if let Some(exclude) = exclude_uid {
        fused.retain(|h| h.uid != exclude);
    }

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.uid.cmp(&b.uid))
            .then_with(|| a.best_step_index.cmp(&b.best_step_index))
    });
    fused.truncate(top_k);
    fused
}
