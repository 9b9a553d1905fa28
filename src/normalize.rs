//! Source-format normalisation into the canonical [`TestDoc`].
//!
//! Raw corpora arrive in several shapes (Xray functional exports, flat API
//! test exports, previously-normalised documents). Each shape has a
//! [`Preprocessor`] with a predicate and a transform; dispatch is
//! first-matching-predicate over [`PREPROCESSORS`].
//!
//! # Field harmonisation
//!
//! | Source field(s) | Canonical field |
//! |-----------------|-----------------|
//! | `uid` \| `issueKey` \| `jiraKey` \| `testCaseId` \| `testId` \| hash(title, source) | `uid` |
//! | `labels` \| `tags` | `tags` (deduplicated) |
//! | `folder` (`/`-separated) \| `folderStructure` (string or array) | `folder_path` |
//! | `summary` \| `title` | `title` |
//! | step `expected` \| `expectedResult` \| `result` (scalar or array) | `expected[]` |
//!
//! Missing `priority` defaults to `Medium`; unrecognised values become null
//! with a warning naming the raw value. All warnings are non-fatal and
//! collected alongside the document.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{Priority, TestDoc, TestStep};

/// A format-specific preprocessor: a predicate that recognises the shape and
/// a transform that converts it.
pub struct Preprocessor {
    pub name: &'static str,
    pub matches: fn(&Value) -> bool,
    pub convert: fn(&Value, &str, DateTime<Utc>) -> Result<(TestDoc, Vec<String>)>,
}

/// Registered preprocessors, probed in order. The canonical passthrough comes
/// first so re-normalising our own output is the identity (modulo timestamps).
pub const PREPROCESSORS: &[Preprocessor] = &[
    Preprocessor {
        name: "canonical",
        matches: |raw| {
            raw.get("uid").is_some()
                && raw.get("title").is_some()
                && raw.get("source").is_some()
                && raw.get("ingested_at").is_some()
        },
        convert: convert_canonical,
    },
    Preprocessor {
        name: "xray-functional",
        matches: |raw| {
            raw.get("issueKey").is_some() && raw.pointer("/testScript/steps").is_some()
        },
        convert: convert_xray_functional,
    },
    Preprocessor {
        name: "flat",
        matches: |raw| {
            raw.get("title").is_some()
                && (raw.get("testSteps").is_some() || raw.get("steps").is_some())
        },
        convert: convert_flat,
    },
    Preprocessor {
        name: "title-only",
        matches: |raw| raw.get("title").is_some() || raw.get("summary").is_some(),
        convert: convert_flat,
    },
];

/// Normalise one raw record into a canonical document plus warnings.
///
/// Dispatches to the first preprocessor whose predicate matches. Records no
/// preprocessor recognises are `InvalidInput` — the ingestion pipeline skips
/// them with a warning rather than aborting.
pub fn normalize(
    raw: &Value,
    source: &str,
    ingested_at: DateTime<Utc>,
) -> Result<(TestDoc, Vec<String>)> {
    if !raw.is_object() {
        return Err(Error::invalid("record is not a JSON object"));
    }
    for pre in PREPROCESSORS {
        if (pre.matches)(raw) {
            return (pre.convert)(raw, source, ingested_at);
        }
    }
    Err(Error::invalid(
        "record matches no known format (expected a title or summary field)",
    ))
}

// ============ Canonical passthrough ============

fn convert_canonical(
    raw: &Value,
    _source: &str,
    ingested_at: DateTime<Utc>,
) -> Result<(TestDoc, Vec<String>)> {
    let mut doc: TestDoc = serde_json::from_value(raw.clone())
        .map_err(|e| Error::invalid(format!("canonical document rejected: {}", e)))?;
    if doc.title.trim().is_empty() {
        return Err(Error::invalid("missing title/summary"));
    }
    doc.ingested_at = ingested_at;
    let warnings = structural_warnings(&doc);
    Ok((doc, warnings))
}

// ============ Xray functional export ============

/// Xray functional exports nest content under `testScript` with the tracker
/// key at the root:
///
/// ```json
/// {
///   "issueKey": "PROJ-123",
///   "summary": "…", "objective": "…",
///   "labels": ["…"], "priority": "P2",
///   "folder": "/Functional/Login",
///   "testScript": { "steps": [ { "index": 1, "action": "…", "data": "…", "result": "…" } ] }
/// }
/// ```
fn convert_xray_functional(
    raw: &Value,
    source: &str,
    ingested_at: DateTime<Utc>,
) -> Result<(TestDoc, Vec<String>)> {
    let mut warnings = Vec::new();

    let external_key = string_field(raw, &["issueKey", "jiraKey"]);
    let title = string_field(raw, &["summary", "title"])
        .ok_or_else(|| Error::invalid("missing title/summary"))?;
    let uid = resolve_uid(raw, &external_key, &title, source, &mut warnings);

    let description = string_field(raw, &["objective", "description"]);
    let raw_steps = raw
        .pointer("/testScript/steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let steps = harmonise_steps(&raw_steps, &uid, &mut warnings);

    let doc = TestDoc {
        uid: uid.clone(),
        external_key,
        title,
        description,
        priority: harmonise_priority(raw.get("priority"), &uid, &mut warnings),
        test_type: string_field(raw, &["testType", "type"]),
        platforms: string_set(raw, &["platforms"]),
        tags: string_set(raw, &["labels", "tags"]),
        folder_path: harmonise_folder(raw),
        related_keys: string_set(raw, &["relatedIssues", "relatedKeys"]),
        steps,
        source: source.to_string(),
        ingested_at,
    };
    warnings.extend(structural_warnings(&doc));
    Ok((doc, warnings))
}

// ============ Flat export (API tests and similar) ============

/// Flat exports carry everything at the root, with `testSteps` instead of a
/// nested script and `expectedResult` per step. `jiraKey` may be null.
fn convert_flat(
    raw: &Value,
    source: &str,
    ingested_at: DateTime<Utc>,
) -> Result<(TestDoc, Vec<String>)> {
    let mut warnings = Vec::new();

    let external_key = string_field(raw, &["jiraKey", "issueKey"]);
    let title = string_field(raw, &["title", "summary"])
        .ok_or_else(|| Error::invalid("missing title/summary"))?;
    let uid = resolve_uid(raw, &external_key, &title, source, &mut warnings);

    let raw_steps = raw
        .get("testSteps")
        .or_else(|| raw.get("steps"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let steps = harmonise_steps(&raw_steps, &uid, &mut warnings);

    let doc = TestDoc {
        uid: uid.clone(),
        external_key,
        title,
        description: string_field(raw, &["description", "objective"]),
        priority: harmonise_priority(raw.get("priority"), &uid, &mut warnings),
        test_type: string_field(raw, &["testType", "type"]),
        platforms: string_set(raw, &["platforms"]),
        tags: string_set(raw, &["tags", "labels"]),
        folder_path: harmonise_folder(raw),
        related_keys: string_set(raw, &["relatedIssues", "relatedKeys"]),
        steps,
        source: source.to_string(),
        ingested_at,
    };
    warnings.extend(structural_warnings(&doc));
    Ok((doc, warnings))
}

// ============ Shared harmonisation helpers ============

/// Pick the uid: explicit `uid`, then the external key, then a source case
/// id, then a deterministic hash of `(title, source)`. Fallbacks raise a
/// provenance warning.
fn resolve_uid(
    raw: &Value,
    external_key: &Option<String>,
    title: &str,
    source: &str,
    warnings: &mut Vec<String>,
) -> String {
    if let Some(uid) = string_field(raw, &["uid"]) {
        return uid;
    }
    if let Some(key) = external_key {
        return key.clone();
    }
    if let Some(case_id) = string_field(raw, &["testCaseId", "testId", "caseId"]) {
        warnings.push(format!(
            "Test '{}': no external key, using case id {} as uid",
            title, case_id
        ));
        return case_id;
    }
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let uid = format!("gen-{:x}", digest);
    let uid = uid[..20].to_string();
    warnings.push(format!(
        "Test '{}': no identifier found, derived uid {} from title",
        title, uid
    ));
    uid
}

/// Harmonise raw steps to `{index, action, data, expected[]}`.
///
/// Scalar `expected` values are wrapped in a one-element array; missing
/// indices are assigned positionally (1-based); a duplicate index keeps the
/// later step and raises a warning.
fn harmonise_steps(raw_steps: &[Value], uid: &str, warnings: &mut Vec<String>) -> Vec<TestStep> {
    let mut steps: Vec<TestStep> = Vec::new();

    for (pos, raw) in raw_steps.iter().enumerate() {
        let step = match raw {
            Value::Object(_) => {
                let action = string_field(raw, &["action", "description"]).unwrap_or_default();
                if action.trim().is_empty() {
                    warnings.push(format!(
                        "Test {}: step {} has no action, dropped",
                        uid,
                        pos + 1
                    ));
                    continue;
                }
                let index = raw
                    .get("index")
                    .and_then(Value::as_u64)
                    .filter(|&i| i >= 1)
                    .unwrap_or(pos as u64 + 1) as u32;
                TestStep {
                    index,
                    action,
                    data: string_field(raw, &["data", "testData"]),
                    expected: expected_list(raw),
                }
            }
            Value::String(s) if !s.trim().is_empty() => TestStep {
                index: pos as u32 + 1,
                action: s.clone(),
                data: None,
                expected: Vec::new(),
            },
            _ => {
                warnings.push(format!(
                    "Test {}: step {} is not an object or string, dropped",
                    uid,
                    pos + 1
                ));
                continue;
            }
        };

        if let Some(existing) = steps.iter_mut().find(|s| s.index == step.index) {
            warnings.push(format!(
                "Test {}: duplicate step index {}, keeping the later step",
                uid, step.index
            ));
            *existing = step;
        } else {
            steps.push(step);
        }
    }

    steps.sort_by_key(|s| s.index);
    steps
}

/// Expected outcomes under `expected`, `expectedResult`, or `result`;
/// always an array.
fn expected_list(raw: &Value) -> Vec<String> {
    for key in ["expected", "expectedResult", "result"] {
        match raw.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return vec![s.clone()],
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.trim().is_empty())
                    .map(str::to_string)
                    .collect();
            }
            _ => continue,
        }
    }
    Vec::new()
}

/// Map source priority spellings onto the canonical scale. Missing values
/// default to `Medium`; unrecognised ones become null with a warning.
pub fn harmonise_priority(
    raw: Option<&Value>,
    uid: &str,
    warnings: &mut Vec<String>,
) -> Option<Priority> {
    let text = match raw {
        None | Some(Value::Null) => return Some(Priority::Medium),
        Some(Value::String(s)) if s.trim().is_empty() => return Some(Priority::Medium),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    };

    match text.trim().to_lowercase().as_str() {
        "critical" | "1" | "p1" | "highest" => Some(Priority::Critical),
        "high" | "2" | "p2" => Some(Priority::High),
        "medium" | "3" | "p3" | "normal" => Some(Priority::Medium),
        "low" | "4" | "p4" | "lowest" => Some(Priority::Low),
        _ => {
            warnings.push(format!(
                "Test {}: unrecognised priority '{}', left unset",
                uid, text
            ));
            None
        }
    }
}

/// `folder` ("/"-separated string) or `folderStructure` (string or array)
/// → ordered path segments, separators trimmed.
fn harmonise_folder(raw: &Value) -> Vec<String> {
    let value = raw.get("folder").or_else(|| raw.get("folderStructure"));
    match value {
        Some(Value::String(s)) => s
            .replace('\\', "/")
            .split('/')
            .filter(|seg| !seg.trim().is_empty())
            .map(|seg| seg.trim().to_string())
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|seg| !seg.trim().is_empty())
            .map(|seg| seg.trim().to_string())
            .collect(),
        _ => Vec::new(),
    }
}

/// First non-empty string under any of the given keys.
fn string_field(raw: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = raw.get(key) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Deduplicated string set (case-preserved, first occurrence wins) from the
/// first present key; a scalar string becomes a one-element set.
fn string_set(raw: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match raw.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return vec![s.trim().to_string()],
            Some(Value::Array(items)) => {
                let mut out: Vec<String> = Vec::new();
                for item in items.iter().filter_map(Value::as_str) {
                    let trimmed = item.trim();
                    if !trimmed.is_empty() && !out.iter().any(|x| x == trimmed) {
                        out.push(trimmed.to_string());
                    }
                }
                return out;
            }
            _ => continue,
        }
    }
    Vec::new()
}

/// Non-fatal structural warnings on the finished document.
fn structural_warnings(doc: &TestDoc) -> Vec<String> {
    let mut warnings = Vec::new();
    if doc.title.trim().is_empty() {
        warnings.push(format!("Test {} has no title", doc.uid));
    }
    if doc.steps.is_empty() {
        warnings.push(format!("Test {} has no steps", doc.uid));
    }
    if doc.tags.is_empty() {
        warnings.push(format!("Test {} has no tags", doc.uid));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn xray_functional_shape_is_recognised() {
        let raw = json!({
            "issueKey": "PROJ-42",
            "summary": "login page loads",
            "objective": "verify the login page renders correctly",
            "labels": ["auth", "smoke", "auth"],
            "priority": "P2",
            "folder": "/Functional/Login/",
            "testScript": {
                "steps": [
                    {"index": 1, "action": "enter username", "data": "user=admin", "result": "field accepts input"},
                    {"index": 2, "action": "click submit", "result": ["login succeeds"]}
                ]
            }
        });

        let (doc, _warnings) = normalize(&raw, "functional", now()).unwrap();
        assert_eq!(doc.uid, "PROJ-42");
        assert_eq!(doc.external_key.as_deref(), Some("PROJ-42"));
        assert_eq!(doc.title, "login page loads");
        assert_eq!(doc.priority, Some(Priority::High));
        assert_eq!(doc.tags, vec!["auth", "smoke"]);
        assert_eq!(doc.folder_path, vec!["Functional", "Login"]);
        assert_eq!(doc.steps.len(), 2);
        assert_eq!(doc.steps[0].data.as_deref(), Some("user=admin"));
        assert_eq!(doc.steps[0].expected, vec!["field accepts input"]);
        assert_eq!(doc.steps[1].expected, vec!["login succeeds"]);
    }

    #[test]
    fn flat_shape_with_null_key_falls_back_to_case_id() {
        let raw = json!({
            "title": "API localization test",
            "jiraKey": null,
            "testCaseId": "API-001",
            "priority": "High",
            "platforms": ["iOS", "Android"],
            "folderStructure": ["API Tests", "Localization"],
            "testSteps": [
                {"action": "send GET request", "expectedResult": "200 status"}
            ]
        });

        let (doc, warnings) = normalize(&raw, "api", now()).unwrap();
        assert_eq!(doc.uid, "API-001");
        assert_eq!(doc.external_key, None);
        assert_eq!(doc.folder_path, vec!["API Tests", "Localization"]);
        assert_eq!(doc.steps[0].index, 1);
        assert_eq!(doc.steps[0].expected, vec!["200 status"]);
        assert!(warnings.iter().any(|w| w.contains("case id")));
    }

    #[test]
    fn missing_identifier_derives_deterministic_uid() {
        let raw = json!({"title": "orphan test", "steps": []});
        let (a, warnings) = normalize(&raw, "src", now()).unwrap();
        let (b, _) = normalize(&raw, "src", now()).unwrap();
        assert_eq!(a.uid, b.uid);
        assert!(a.uid.starts_with("gen-"));
        assert!(warnings.iter().any(|w| w.contains("derived uid")));

        // Different source, different uid.
        let (c, _) = normalize(&raw, "other", now()).unwrap();
        assert_ne!(a.uid, c.uid);
    }

    #[test]
    fn duplicate_step_index_keeps_later_step() {
        let raw = json!({
            "issueKey": "PROJ-7",
            "summary": "dup steps",
            "testScript": {"steps": [
                {"index": 1, "action": "first"},
                {"index": 1, "action": "second"}
            ]}
        });
        let (doc, warnings) = normalize(&raw, "functional", now()).unwrap();
        assert_eq!(doc.steps.len(), 1);
        assert_eq!(doc.steps[0].action, "second");
        assert!(warnings.iter().any(|w| w.contains("duplicate step index")));
    }

    #[test]
    fn unrecognised_priority_is_flagged_not_fatal() {
        let raw = json!({
            "issueKey": "PROJ-8",
            "summary": "weird priority",
            "priority": "Blocker",
            "testScript": {"steps": []}
        });
        let (doc, warnings) = normalize(&raw, "functional", now()).unwrap();
        assert_eq!(doc.priority, None);
        assert!(warnings.iter().any(|w| w.contains("Blocker")));
    }

    #[test]
    fn missing_priority_defaults_to_medium() {
        let raw = json!({
            "issueKey": "PROJ-9",
            "summary": "no priority",
            "testScript": {"steps": []}
        });
        let (doc, _) = normalize(&raw, "functional", now()).unwrap();
        assert_eq!(doc.priority, Some(Priority::Medium));
    }

    #[test]
    fn non_object_record_is_invalid() {
        assert!(normalize(&json!([1, 2, 3]), "src", now()).is_err());
        assert!(normalize(&json!("nope"), "src", now()).is_err());
    }

    #[test]
    fn unrecognised_object_is_invalid() {
        assert!(normalize(&json!({"foo": "bar"}), "src", now()).is_err());
    }

    // Normalise(Serialize(Normalise(x))) == Normalise(x), timestamps pinned.
    #[test]
    fn normalisation_is_idempotent_through_serialisation() {
        let raw = json!({
            "issueKey": "PROJ-42",
            "summary": "login page loads",
            "objective": "verify",
            "labels": ["auth"],
            "priority": "High",
            "folder": "Functional/Login",
            "testScript": {"steps": [
                {"index": 1, "action": "enter username", "result": "ok"}
            ]}
        });

        let (once, _) = normalize(&raw, "functional", now()).unwrap();
        let serialized = serde_json::to_value(&once).unwrap();
        let (twice, _) = normalize(&serialized, "functional", now()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn canonical_record_with_blank_title_is_rejected() {
        let raw = json!({
            "uid": "T-1",
            "title": "   ",
            "source": "unit",
            "ingested_at": "2025-06-01T00:00:00Z",
            "steps": []
        });
        assert!(normalize(&raw, "unit", now()).is_err());
    }

    #[test]
    fn structural_warnings_flag_missing_title() {
        let doc = TestDoc {
            uid: "T-1".to_string(),
            external_key: None,
            title: String::new(),
            description: None,
            priority: None,
            test_type: None,
            platforms: vec![],
            tags: vec!["smoke".to_string()],
            folder_path: vec![],
            related_keys: vec![],
            steps: vec![],
            source: "unit".to_string(),
            ingested_at: now(),
        };
        let warnings = structural_warnings(&doc);
        assert!(warnings.iter().any(|w| w.contains("has no title")));
    }

    #[test]
    fn scalar_tag_becomes_single_element_set() {
        let raw = json!({
            "title": "scalar tag",
            "tags": "smoke",
            "steps": []
        });
        let (doc, _) = normalize(&raw, "src", now()).unwrap();
        assert_eq!(doc.tags, vec!["smoke"]);
    }
}
