//! Core data models used throughout Testlens.
//!
//! These types represent the test documents, their execution steps, and the
//! search results that flow through the ingestion and retrieval pipeline:
//!
//! ```text
//! raw record → normalize() → TestDoc ──→ embed() → doc vector
//!                               │
//!                               └─ steps[] ─→ embed() → step vectors
//!                                        ↓
//!                                   search() → SearchHit
//! ```
//!
//! A [`TestDoc`] is the unit of ingestion and retrieval; its [`TestStep`]s
//! are indexed separately on the step tier and roll up to their parent at
//! query time. [`SearchHit`] is the ranked output shape, carrying the full
//! document payload plus the indices of the steps that matched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Test priority, normalized to a fixed four-level scale.
///
/// Source systems use a zoo of spellings (`P1`, `1`, `critical`, …); the
/// normaliser maps them all onto this enum. Values it cannot map become
/// `None` on the document plus a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }

    /// Parse an already-canonical priority string (as stored in the DB).
    pub fn from_canonical(s: &str) -> Option<Self> {
        match s {
            "Critical" => Some(Priority::Critical),
            "High" => Some(Priority::High),
            "Medium" => Some(Priority::Medium),
            "Low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// A single execution step within a test case.
///
/// Steps are 1-indexed and unique within their parent document. Each step
/// is embedded individually on the step tier so that a query can match a
/// specific action deep inside a long test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    /// 1-based position within the parent document.
    pub index: u32,
    /// The action the tester (or automation) performs.
    pub action: String,
    /// Optional input data for the action.
    #[serde(default)]
    pub data: Option<String>,
    /// Zero or more expected outcomes.
    #[serde(default)]
    pub expected: Vec<String>,
}

impl TestStep {
    /// Text fed to the embedding provider for this step:
    /// action, then data, then expected outcomes joined with `"; "`.
    pub fn embedding_text(&self) -> String {
        let mut text = self.action.clone();
        if let Some(data) = &self.data {
            if !data.trim().is_empty() {
                text.push('\n');
                text.push_str(data);
            }
        }
        if !self.expected.is_empty() {
            text.push('\n');
            text.push_str(&self.expected.join("; "));
        }
        text
    }
}

/// Canonical normalized test document — the unit of ingestion and retrieval.
///
/// Produced by the normaliser from source-specific records; stored on the
/// doc tier with one embedding vector, while its steps are stored on the
/// step tier keyed by `(uid, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDoc {
    /// Globally unique, stable across re-ingests. Opaque outside the core.
    pub uid: String,
    /// External tracker key (e.g. a JIRA issue key), if the source had one.
    #[serde(default)]
    pub external_key: Option<String>,
    /// Required human-readable title.
    pub title: String,
    /// Longer description; concatenated with the title for embedding.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Open-ended test type (e.g. `Manual`, `API`); whitelisted at filter time.
    #[serde(default)]
    pub test_type: Option<String>,
    /// Target platforms (deduplicated, case-preserved).
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Labels/tags (deduplicated, case-preserved).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Hierarchical folder path, outermost first.
    #[serde(default)]
    pub folder_path: Vec<String>,
    /// Cross-references to related tracker issues.
    #[serde(default)]
    pub related_keys: Vec<String>,
    /// Ordered execution steps; may be empty.
    #[serde(default)]
    pub steps: Vec<TestStep>,
    /// Origin marker (source id the document was ingested from).
    pub source: String,
    /// Set by ingestion; monotonically non-decreasing per uid.
    pub ingested_at: DateTime<Utc>,
}

impl TestDoc {
    /// Text fed to the embedding provider for the document:
    /// title, then description when present.
    pub fn embedding_text(&self) -> String {
        match &self.description {
            Some(d) if !d.trim().is_empty() => format!("{}\n{}", self.title, d),
            _ => self.title.clone(),
        }
    }
}

/// One ranked result from the retrieval engine.
///
/// The full document payload is denormalised into the hit so callers never
/// need a second lookup; `matched_step_indices` lists the steps that
/// contributed on the step tier (empty when only the doc tier matched).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub uid: String,
    /// Fused relevance score in `[0, 1]`, higher is better.
    pub score: f64,
    /// 1-based indices of the parent's steps that matched, ascending.
    pub matched_step_indices: Vec<u32>,
    pub doc: TestDoc,
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    /// Records pulled from the source, valid or not.
    pub docs_in: u64,
    /// Documents successfully upserted.
    pub docs_written: u64,
    /// Steps successfully upserted.
    pub steps_written: u64,
    /// Records skipped (failed normalisation).
    pub skipped: u64,
    /// Non-fatal issues (fallback uids, missing fields, duplicate steps, …).
    pub warnings: Vec<String>,
    /// Chunk-level failures that persisted after the deferred retry.
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: u32, action: &str, data: Option<&str>, expected: &[&str]) -> TestStep {
        TestStep {
            index,
            action: action.to_string(),
            data: data.map(|s| s.to_string()),
            expected: expected.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn doc_embedding_text_concatenates_title_and_description() {
        let doc = TestDoc {
            uid: "T-1".into(),
            external_key: None,
            title: "login page loads".into(),
            description: Some("verify the login page renders".into()),
            priority: None,
            test_type: None,
            platforms: vec![],
            tags: vec![],
            folder_path: vec![],
            related_keys: vec![],
            steps: vec![],
            source: "unit".into(),
            ingested_at: Utc::now(),
        };
        assert_eq!(
            doc.embedding_text(),
            "login page loads\nverify the login page renders"
        );
    }

    #[test]
    fn doc_embedding_text_skips_blank_description() {
        let doc = TestDoc {
            uid: "T-2".into(),
            external_key: None,
            title: "reset password".into(),
            description: Some("   ".into()),
            priority: None,
            test_type: None,
            platforms: vec![],
            tags: vec![],
            folder_path: vec![],
            related_keys: vec![],
            steps: vec![],
            source: "unit".into(),
            ingested_at: Utc::now(),
        };
        assert_eq!(doc.embedding_text(), "reset password");
    }

    #[test]
    fn step_embedding_text_joins_all_parts() {
        let s = step(
            1,
            "enter username",
            Some("user=admin"),
            &["field accepts input", "no error shown"],
        );
        assert_eq!(
            s.embedding_text(),
            "enter username\nuser=admin\nfield accepts input; no error shown"
        );
    }

    #[test]
    fn step_embedding_text_without_data_or_expected() {
        let s = step(2, "click submit", None, &[]);
        assert_eq!(s.embedding_text(), "click submit");
    }

    #[test]
    fn priority_roundtrip() {
        for p in [
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low,
        ] {
            assert_eq!(Priority::from_canonical(p.as_str()), Some(p));
        }
        assert_eq!(Priority::from_canonical("urgent"), None);
    }
}
