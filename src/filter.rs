//! Filter validation and compilation.
//!
//! User filter objects are validated against a fixed whitelist and compiled
//! into store-native SQL clauses. Unknown keys, oversized values, control
//! characters, and empty set members are all rejected with per-field error
//! paths — nothing user-supplied is ever interpolated into SQL text; values
//! travel as bind parameters.
//!
//! | Field | Type | Semantics |
//! |-------|------|-----------|
//! | `tags` | string set | document tags ⊇ given |
//! | `platforms` | string set | document platforms ⊇ given |
//! | `priority` | string | exact match |
//! | `test_type` | string | exact match |
//! | `folder_prefix` | string sequence | folder path starts with prefix |
//! | `related_keys` | string set | related keys intersect given |
//! | `external_key_pattern` | glob (`*`, `?`) | anchored match on external key |
//!
//! The same compiled filter applies to both tiers: step-tier queries join
//! the parent document row, so every clause targets the `td` alias.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, FieldError, Result};

const MAX_STRING_LEN: usize = 256;
const MAX_SET_LEN: usize = 64;

/// Whitelisted search filters. All fields optional; an empty filter compiles
/// to no SQL clauses at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_prefix: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_key_pattern: Option<String>,
}

/// A value bound into the compiled SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Text(String),
    TextArray(Vec<String>),
}

/// One compiled clause: `{lhs}${n}{rhs}` once the parameter number is known.
#[derive(Debug, Clone)]
struct Clause {
    lhs: String,
    rhs: String,
    bind: BindValue,
}

/// Store-native filter expression: SQL fragments plus their bind values,
/// referencing the doc-tier alias `td`.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    clauses: Vec<Clause>,
}

impl CompiledFilter {
    /// Append ` AND <clause>` fragments to `sql`, numbering parameters from
    /// `*next_param` and advancing it. Bind values follow via [`Self::binds`]
    /// in the same order.
    pub fn append_sql(&self, sql: &mut String, next_param: &mut usize) {
        for clause in &self.clauses {
            sql.push_str(&format!(" AND {}${}{}", clause.lhs, next_param, clause.rhs));
            *next_param += 1;
        }
    }

    pub fn binds(&self) -> impl Iterator<Item = &BindValue> {
        self.clauses.iter().map(|c| &c.bind)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        *self == SearchFilters::default()
    }

    /// Parse a raw filter object, enforcing the whitelist.
    ///
    /// All violations are collected and reported together as one
    /// `InvalidInput` with per-field paths.
    pub fn parse(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Null => return Ok(SearchFilters::default()),
            Value::Object(map) => map,
            _ => {
                return Err(Error::invalid_fields(
                    "filters must be an object",
                    vec![FieldError::new("filters", "expected a JSON object")],
                ))
            }
        };

        let mut filters = SearchFilters::default();
        let mut errors = Vec::new();

        for (key, raw) in object {
            match key.as_str() {
                "tags" => filters.tags = take_string_array(key, raw, &mut errors),
                "platforms" => filters.platforms = take_string_array(key, raw, &mut errors),
                "priority" => filters.priority = take_string(key, raw, &mut errors),
                "test_type" => filters.test_type = take_string(key, raw, &mut errors),
                "folder_prefix" => filters.folder_prefix = take_string_array(key, raw, &mut errors),
                "related_keys" => filters.related_keys = take_string_array(key, raw, &mut errors),
                "external_key_pattern" => {
                    filters.external_key_pattern = take_string(key, raw, &mut errors)
                }
                _ => errors.push(FieldError::new(
                    format!("filters.{}", key),
                    "unknown filter field",
                )),
            }
        }

        if errors.is_empty() {
            Ok(filters)
        } else {
            Err(Error::invalid_fields("filter rejected", errors))
        }
    }

    /// Validate bounds and compile to SQL clauses against the `td` alias.
    pub fn compile(&self) -> Result<CompiledFilter> {
        let mut errors = Vec::new();
        let mut compiled = CompiledFilter::default();

        if let Some(tags) = &self.tags {
            if let Some(values) = checked_set("filters.tags", tags, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: "td.tags @> ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::TextArray(values),
                });
            }
        }

        if let Some(platforms) = &self.platforms {
            if let Some(values) = checked_set("filters.platforms", platforms, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: "td.platforms @> ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::TextArray(values),
                });
            }
        }

        if let Some(priority) = &self.priority {
            if let Some(value) = checked_string("filters.priority", priority, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: "td.priority = ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::Text(value),
                });
            }
        }

        if let Some(test_type) = &self.test_type {
            if let Some(value) = checked_string("filters.test_type", test_type, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: "td.test_type = ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::Text(value),
                });
            }
        }

        if let Some(prefix) = &self.folder_prefix {
            if let Some(values) = checked_set("filters.folder_prefix", prefix, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: format!("td.folder_path[1:{}] = ", values.len()),
                    rhs: String::new(),
                    bind: BindValue::TextArray(values),
                });
            }
        }

        if let Some(keys) = &self.related_keys {
            if let Some(values) = checked_set("filters.related_keys", keys, &mut errors) {
                compiled.clauses.push(Clause {
                    lhs: "td.related_keys && ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::TextArray(values),
                });
            }
        }

        if let Some(pattern) = &self.external_key_pattern {
            if let Some(value) =
                checked_string("filters.external_key_pattern", pattern, &mut errors)
            {
                compiled.clauses.push(Clause {
                    lhs: "td.external_key LIKE ".to_string(),
                    rhs: String::new(),
                    bind: BindValue::Text(glob_to_like(&value)),
                });
            }
        }

        if errors.is_empty() {
            Ok(compiled)
        } else {
            Err(Error::invalid_fields("filter rejected", errors))
        }
    }
}

/// Translate the restricted glob syntax (`*`, `?`) into an anchored SQL
/// `LIKE` pattern, escaping the LIKE metacharacters in literal positions.
fn glob_to_like(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' => out.push('%'),
            '?' => out.push('_'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

fn take_string(key: &str, raw: &Value, errors: &mut Vec<FieldError>) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        _ => {
            errors.push(FieldError::new(
                format!("filters.{}", key),
                "expected a string",
            ));
            None
        }
    }
}

fn take_string_array(key: &str, raw: &Value, errors: &mut Vec<FieldError>) -> Option<Vec<String>> {
    match raw {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    _ => errors.push(FieldError::new(
                        format!("filters.{}[{}]", key, i),
                        "expected a string",
                    )),
                }
            }
            Some(out)
        }
        Value::String(s) => Some(vec![s.clone()]),
        _ => {
            errors.push(FieldError::new(
                format!("filters.{}", key),
                "expected an array of strings",
            ));
            None
        }
    }
}

/// Bounds-check a single string: non-empty, length-capped, no control chars.
fn checked_string(path: &str, value: &str, errors: &mut Vec<FieldError>) -> Option<String> {
    if value.is_empty() {
        errors.push(FieldError::new(path, "must not be empty"));
        return None;
    }
    if value.len() > MAX_STRING_LEN {
        errors.push(FieldError::new(
            path,
            format!("exceeds {} bytes", MAX_STRING_LEN),
        ));
        return None;
    }
    if value.chars().any(char::is_control) {
        errors.push(FieldError::new(path, "contains control characters"));
        return None;
    }
    Some(value.to_string())
}

/// Bounds-check a string set: size-capped, every member checked.
fn checked_set(path: &str, values: &[String], errors: &mut Vec<FieldError>) -> Option<Vec<String>> {
    if values.is_empty() {
        errors.push(FieldError::new(path, "must not be empty"));
        return None;
    }
    if values.len() > MAX_SET_LEN {
        errors.push(FieldError::new(
            path,
            format!("exceeds {} entries", MAX_SET_LEN),
        ));
        return None;
    }
    let before = errors.len();
    let mut out = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        if let Some(v) = checked_string(&format!("{}[{}]", path, i), value, errors) {
            out.push(v);
        }
    }
    if errors.len() > before {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(compiled: &CompiledFilter) -> String {
        let mut sql = String::from("WHERE TRUE");
        let mut param = 2;
        compiled.append_sql(&mut sql, &mut param);
        sql
    }

    #[test]
    fn empty_filters_compile_to_nothing() {
        let filters = SearchFilters::parse(&json!({})).unwrap();
        assert!(filters.is_empty());
        let compiled = filters.compile().unwrap();
        assert!(compiled.is_empty());
        assert_eq!(render(&compiled), "WHERE TRUE");
    }

    #[test]
    fn null_filters_are_empty() {
        let filters = SearchFilters::parse(&Value::Null).unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn all_whitelisted_fields_compile() {
        let filters = SearchFilters::parse(&json!({
            "tags": ["auth", "smoke"],
            "platforms": ["iOS"],
            "priority": "High",
            "test_type": "Manual",
            "folder_prefix": ["Functional", "Login"],
            "related_keys": ["PROJ-1"],
            "external_key_pattern": "PROJ-*"
        }))
        .unwrap();

        let compiled = filters.compile().unwrap();
        let sql = render(&compiled);
        assert!(sql.contains("td.tags @> $2"));
        assert!(sql.contains("td.platforms @> $3"));
        assert!(sql.contains("td.priority = $4"));
        assert!(sql.contains("td.test_type = $5"));
        assert!(sql.contains("td.folder_path[1:2] = $6"));
        assert!(sql.contains("td.related_keys && $7"));
        assert!(sql.contains("td.external_key LIKE $8"));
        assert_eq!(compiled.binds().count(), 7);
    }

    #[test]
    fn unknown_key_is_rejected_with_path() {
        let err = SearchFilters::parse(&json!({"owner": "me"})).unwrap_err();
        match err {
            Error::InvalidInput { fields, .. } => {
                assert_eq!(fields[0].field, "filters.owner");
            }
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn non_object_filters_rejected() {
        assert!(SearchFilters::parse(&json!([1, 2])).is_err());
        assert!(SearchFilters::parse(&json!("priority=High")).is_err());
    }

    #[test]
    fn empty_string_in_set_rejected() {
        let filters = SearchFilters::parse(&json!({"tags": ["ok", ""]})).unwrap();
        let err = filters.compile().unwrap_err();
        match err {
            Error::InvalidInput { fields, .. } => {
                assert!(fields.iter().any(|f| f.field == "filters.tags[1]"));
            }
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[test]
    fn oversized_values_rejected() {
        let long = "x".repeat(MAX_STRING_LEN + 1);
        let filters = SearchFilters {
            priority: Some(long),
            ..Default::default()
        };
        assert!(filters.compile().is_err());

        let big_set: Vec<String> = (0..MAX_SET_LEN + 1).map(|i| format!("t{}", i)).collect();
        let filters = SearchFilters {
            tags: Some(big_set),
            ..Default::default()
        };
        assert!(filters.compile().is_err());
    }

    #[test]
    fn control_characters_rejected() {
        let filters = SearchFilters {
            priority: Some("High\u{0007}".to_string()),
            ..Default::default()
        };
        assert!(filters.compile().is_err());
    }

    #[test]
    fn glob_translation_is_anchored_and_escaped() {
        assert_eq!(glob_to_like("PROJ-*"), "PROJ-%");
        assert_eq!(glob_to_like("PROJ-?"), "PROJ-_");
        assert_eq!(glob_to_like("100%_done"), "100\\%\\_done");
        assert_eq!(glob_to_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn scalar_string_promotes_to_set() {
        let filters = SearchFilters::parse(&json!({"tags": "smoke"})).unwrap();
        assert_eq!(filters.tags, Some(vec!["smoke".to_string()]));
    }

    #[test]
    fn multiple_errors_reported_together() {
        let err = SearchFilters::parse(&json!({
            "owner": "me",
            "tags": [42],
        }))
        .unwrap_err();
        match err {
            Error::InvalidInput { fields, .. } => assert_eq!(fields.len(), 2),
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }
}
