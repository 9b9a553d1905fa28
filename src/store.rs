//! Two-tier vector store adapter.
//!
//! [`VectorStore`] is the only module that talks SQL to the store. It exposes
//! typed operations over the two pgvector-backed tables (`test_docs` and
//! `test_steps`): upserts, deletes, filtered kNN, point fetch, and counts.
//! [`VectorStore::replace_doc`] swaps a document and its steps inside a
//! single transaction, so ingestion is atomic per uid.
//!
//! # Score semantics
//!
//! pgvector's `<=>` operator returns cosine distance; the adapter converts
//! with `1 - distance` and clamps at zero, so both tiers report a similarity
//! in `[0, 1]` where 1 is identical. Scores are directly comparable across
//! tiers because every stored vector is unit-normalised.
//!
//! # Filters on the step tier
//!
//! Step-tier kNN joins the parent document row, so the same compiled filter
//! (always phrased against the `td` alias) applies to both tiers.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::{BindValue, CompiledFilter};
use crate::models::{Priority, TestDoc, TestStep};

/// Attempts for transient upsert/delete failures before giving up.
const WRITE_RETRIES: u32 = 3;

/// A doc-tier kNN hit: similarity score plus the full payload (steps are not
/// hydrated here; the retrieval engine fetches them only when needed).
#[derive(Debug, Clone)]
pub struct DocHit {
    pub uid: String,
    pub score: f64,
    pub doc: TestDoc,
}

/// A step-tier kNN hit, referencing its parent document.
#[derive(Debug, Clone)]
pub struct StepHit {
    pub parent_uid: String,
    pub index: u32,
    pub score: f64,
}

/// Store-wide counts for health and stats reporting.
#[derive(Debug, Clone, Default)]
pub struct StoreCounts {
    pub doc_count: i64,
    pub step_count: i64,
    pub by_source: Vec<(String, i64)>,
    pub by_priority: Vec<(String, i64)>,
}

/// Typed adapter over the two-tier store. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct VectorStore {
    pool: PgPool,
}

impl VectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert a batch of documents with their vectors. `ingested_at` never
    /// moves backwards for an existing uid.
    pub async fn upsert_docs(&self, batch: &[(TestDoc, Vec<f32>)]) -> Result<()> {
        retry_transient(|| async {
            let mut conn = self.pool.acquire().await?;
            for (doc, vector) in batch {
                upsert_doc_conn(&mut conn, doc, vector).await?;
            }
            Ok(())
        })
        .await
    }

    /// Upsert a batch of steps for one parent document.
    pub async fn upsert_steps(
        &self,
        parent_uid: &str,
        steps: &[(TestStep, Vec<f32>)],
    ) -> Result<()> {
        retry_transient(|| async {
            let mut conn = self.pool.acquire().await?;
            for (step, vector) in steps {
                upsert_step_conn(&mut conn, parent_uid, step, vector).await?;
            }
            Ok(())
        })
        .await
    }

    /// Atomically replace one document and all of its steps.
    ///
    /// Runs inside a single transaction to keep the per-uid replace atomic:
    /// 1. Deletes the old steps of the document.
    /// 2. Upserts the document row.
    /// 3. Inserts the new steps.
    ///
    /// A crash or error at any point rolls the whole replace back, so the
    /// previous version of the document stays fully visible.
    pub async fn replace_doc(
        &self,
        doc: &TestDoc,
        doc_vector: &[f32],
        steps: &[(TestStep, Vec<f32>)],
    ) -> Result<()> {
        retry_transient(|| async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM test_steps WHERE parent_uid = $1")
                .bind(&doc.uid)
                .execute(&mut *tx)
                .await?;

            upsert_doc_conn(&mut tx, doc, doc_vector).await?;
            for (step, vector) in steps {
                upsert_step_conn(&mut tx, &doc.uid, step, vector).await?;
            }

            tx.commit().await.map_err(Error::from)
        })
        .await
    }

    /// Delete one document (steps cascade). Returns the number of docs removed.
    pub async fn delete_doc(&self, uid: &str) -> Result<u64> {
        let result = retry_transient(|| async {
            sqlx::query("DELETE FROM test_docs WHERE uid = $1")
                .bind(uid)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete all steps of one parent. Safe when the parent has none.
    pub async fn delete_steps_by_parent(&self, uid: &str) -> Result<u64> {
        let result = retry_transient(|| async {
            sqlx::query("DELETE FROM test_steps WHERE parent_uid = $1")
                .bind(uid)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Filtered approximate nearest neighbours on the doc tier.
    pub async fn knn_docs(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &CompiledFilter,
    ) -> Result<Vec<DocHit>> {
        let mut sql = String::from(
            "SELECT td.uid, td.external_key, td.title, td.description, td.priority, \
             td.test_type, td.platforms, td.tags, td.folder_path, td.related_keys, \
             td.source, td.ingested_at, 1 - (td.embedding <=> $1::vector) AS score \
             FROM test_docs td WHERE TRUE",
        );
        let mut next_param = 2;
        filter.append_sql(&mut sql, &mut next_param);
        sql.push_str(&format!(
            " ORDER BY td.embedding <=> $1::vector LIMIT {}",
            k
        ));

        let mut query = sqlx::query(&sql).bind(vector_literal(query_vector));
        for bind in filter.binds() {
            query = match bind {
                BindValue::Text(s) => query.bind(s),
                BindValue::TextArray(v) => query.bind(v),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(DocHit {
                    uid: row.get("uid"),
                    score: clamp_score(row.get("score")),
                    doc: doc_from_row(row)?,
                })
            })
            .collect()
    }

    /// Filtered approximate nearest neighbours on the step tier. Filters
    /// apply to the parent document via the join.
    pub async fn knn_steps(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &CompiledFilter,
    ) -> Result<Vec<StepHit>> {
        let mut sql = String::from(
            "SELECT ts.parent_uid, ts.step_index, 1 - (ts.embedding <=> $1::vector) AS score \
             FROM test_steps ts JOIN test_docs td ON td.uid = ts.parent_uid WHERE TRUE",
        );
        let mut next_param = 2;
        filter.append_sql(&mut sql, &mut next_param);
        sql.push_str(&format!(
            " ORDER BY ts.embedding <=> $1::vector LIMIT {}",
            k
        ));

        let mut query = sqlx::query(&sql).bind(vector_literal(query_vector));
        for bind in filter.binds() {
            query = match bind {
                BindValue::Text(s) => query.bind(s),
                BindValue::TextArray(v) => query.bind(v),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| StepHit {
                parent_uid: row.get("parent_uid"),
                index: row.get::<i32, _>("step_index") as u32,
                score: clamp_score(row.get("score")),
            })
            .collect())
    }

    /// Fetch one document with its steps, or `None`.
    pub async fn fetch_doc(&self, uid: &str) -> Result<Option<TestDoc>> {
        let row = sqlx::query(
            "SELECT uid, external_key, title, description, priority, test_type, platforms, \
             tags, folder_path, related_keys, source, ingested_at \
             FROM test_docs WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut doc = doc_from_row(&row)?;
        doc.steps = self.fetch_steps_by_parent(uid).await?;
        Ok(Some(doc))
    }

    /// Batch fetch documents (with steps) by uid; missing uids are skipped.
    pub async fn fetch_docs_by_uids(&self, uids: &[String]) -> Result<Vec<TestDoc>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT uid, external_key, title, description, priority, test_type, platforms, \
             tags, folder_path, related_keys, source, ingested_at \
             FROM test_docs WHERE uid = ANY($1)",
        )
        .bind(uids)
        .fetch_all(&self.pool)
        .await?;

        let mut docs: Vec<TestDoc> = rows
            .iter()
            .map(doc_from_row)
            .collect::<Result<Vec<_>>>()?;

        let step_rows = sqlx::query(
            "SELECT parent_uid, step_index, action, data, expected \
             FROM test_steps WHERE parent_uid = ANY($1) \
             ORDER BY parent_uid, step_index",
        )
        .bind(uids)
        .fetch_all(&self.pool)
        .await?;

        for row in &step_rows {
            let parent: String = row.get("parent_uid");
            if let Some(doc) = docs.iter_mut().find(|d| d.uid == parent) {
                doc.steps.push(step_from_row(row));
            }
        }

        Ok(docs)
    }

    /// Ordered steps for a batch of parents, grouped by parent uid.
    pub async fn fetch_steps_by_parents(
        &self,
        uids: &[String],
    ) -> Result<std::collections::HashMap<String, Vec<TestStep>>> {
        let mut grouped: std::collections::HashMap<String, Vec<TestStep>> =
            std::collections::HashMap::new();
        if uids.is_empty() {
            return Ok(grouped);
        }

        let rows = sqlx::query(
            "SELECT parent_uid, step_index, action, data, expected \
             FROM test_steps WHERE parent_uid = ANY($1) \
             ORDER BY parent_uid, step_index",
        )
        .bind(uids)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let parent: String = row.get("parent_uid");
            grouped.entry(parent).or_default().push(step_from_row(row));
        }
        Ok(grouped)
    }

    /// Ordered steps of one parent document.
    pub async fn fetch_steps_by_parent(&self, uid: &str) -> Result<Vec<TestStep>> {
        let rows = sqlx::query(
            "SELECT parent_uid, step_index, action, data, expected \
             FROM test_steps WHERE parent_uid = $1 ORDER BY step_index",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(step_from_row).collect())
    }

    /// Fetch a document's stored vector (for "find similar" queries).
    pub async fn fetch_doc_vector(&self, uid: &str) -> Result<Option<Vec<f32>>> {
        let text: Option<String> =
            sqlx::query_scalar("SELECT embedding::text FROM test_docs WHERE uid = $1")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;

        match text {
            Some(text) => Ok(Some(parse_vector_literal(&text)?)),
            None => Ok(None),
        }
    }

    /// All documents carrying an external key, bounded. Used by direct lookup,
    /// where more than one match is a conflict.
    pub async fn fetch_by_external_key(&self, key: &str, limit: usize) -> Result<Vec<TestDoc>> {
        let rows = sqlx::query(
            "SELECT uid, external_key, title, description, priority, test_type, platforms, \
             tags, folder_path, related_keys, source, ingested_at \
             FROM test_docs WHERE external_key = $1 ORDER BY uid LIMIT $2",
        )
        .bind(key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut docs: Vec<TestDoc> = rows
            .iter()
            .map(doc_from_row)
            .collect::<Result<Vec<_>>>()?;
        for doc in &mut docs {
            let uid = doc.uid.clone();
            doc.steps = self.fetch_steps_by_parent(&uid).await?;
        }
        Ok(docs)
    }

    /// Store-wide counts plus per-source and per-priority breakdowns.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let doc_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_docs")
            .fetch_one(&self.pool)
            .await?;
        let step_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_steps")
            .fetch_one(&self.pool)
            .await?;

        let by_source = sqlx::query(
            "SELECT source, COUNT(*) AS n FROM test_docs GROUP BY source ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| (row.get("source"), row.get("n")))
        .collect();

        let by_priority = sqlx::query(
            "SELECT COALESCE(priority, '(unset)') AS priority, COUNT(*) AS n \
             FROM test_docs GROUP BY priority ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| (row.get("priority"), row.get("n")))
        .collect();

        Ok(StoreCounts {
            doc_count,
            step_count,
            by_source,
            by_priority,
        })
    }

    /// Cheap reachability probe for health reporting.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Upsert one document row on the given connection (or transaction).
async fn upsert_doc_conn(conn: &mut PgConnection, doc: &TestDoc, vector: &[f32]) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO test_docs
            (uid, external_key, title, description, priority, test_type,
             platforms, tags, folder_path, related_keys, source, ingested_at, embedding)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13::vector)
        ON CONFLICT (uid) DO UPDATE SET
            external_key = EXCLUDED.external_key,
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            priority = EXCLUDED.priority,
            test_type = EXCLUDED.test_type,
            platforms = EXCLUDED.platforms,
            tags = EXCLUDED.tags,
            folder_path = EXCLUDED.folder_path,
            related_keys = EXCLUDED.related_keys,
            source = EXCLUDED.source,
            ingested_at = GREATEST(test_docs.ingested_at, EXCLUDED.ingested_at),
            embedding = EXCLUDED.embedding
        "#,
    )
    .bind(&doc.uid)
    .bind(&doc.external_key)
    .bind(&doc.title)
    .bind(&doc.description)
    .bind(doc.priority.map(|p| p.as_str()))
    .bind(&doc.test_type)
    .bind(&doc.platforms)
    .bind(&doc.tags)
    .bind(&doc.folder_path)
    .bind(&doc.related_keys)
    .bind(&doc.source)
    .bind(doc.ingested_at)
    .bind(vector_literal(vector))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upsert one step row on the given connection (or transaction).
async fn upsert_step_conn(
    conn: &mut PgConnection,
    parent_uid: &str,
    step: &TestStep,
    vector: &[f32],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO test_steps (parent_uid, step_index, action, data, expected, embedding)
        VALUES ($1, $2, $3, $4, $5, $6::vector)
        ON CONFLICT (parent_uid, step_index) DO UPDATE SET
            action = EXCLUDED.action,
            data = EXCLUDED.data,
            expected = EXCLUDED.expected,
            embedding = EXCLUDED.embedding
        "#,
    )
    .bind(parent_uid)
    .bind(step.index as i32)
    .bind(&step.action)
    .bind(&step.data)
    .bind(&step.expected)
    .bind(vector_literal(vector))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Render a vector as a pgvector text literal: `[0.1,0.2,…]`.
pub fn vector_literal(vector: &[f32]) -> String {
    let mut out = String::with_capacity(vector.len() * 8 + 2);
    out.push('[');
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Parse a pgvector text literal back into a float vector.
fn parse_vector_literal(text: &str) -> Result<Vec<f32>> {
    let inner = text
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| Error::Internal(format!("malformed vector literal: {}", text)))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| Error::Internal(format!("malformed vector component: {}", e)))
        })
        .collect()
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 1.0)
}

fn doc_from_row(row: &PgRow) -> Result<TestDoc> {
    let priority: Option<String> = row.get("priority");
    let ingested_at: DateTime<Utc> = row.get("ingested_at");
    Ok(TestDoc {
        uid: row.get("uid"),
        external_key: row.get("external_key"),
        title: row.get("title"),
        description: row.get("description"),
        priority: priority.as_deref().and_then(Priority::from_canonical),
        test_type: row.get("test_type"),
        platforms: row.get("platforms"),
        tags: row.get("tags"),
        folder_path: row.get("folder_path"),
        related_keys: row.get("related_keys"),
        steps: Vec::new(),
        source: row.get("source"),
        ingested_at,
    })
}

fn step_from_row(row: &PgRow) -> TestStep {
    TestStep {
        index: row.get::<i32, _>("step_index") as u32,
        action: row.get("action"),
        data: row.get("data"),
        expected: row.get("expected"),
    }
}

/// Retry a write on transient failures with a short exponential backoff.
async fn retry_transient<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;
    for attempt in 0..WRITE_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Transient("write failed after retries".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_roundtrip() {
        let v = vec![1.0f32, -2.5, 0.125];
        let literal = vector_literal(&v);
        assert_eq!(literal, "[1,-2.5,0.125]");
        assert_eq!(parse_vector_literal(&literal).unwrap(), v);
    }

    #[test]
    fn parse_rejects_malformed_literals() {
        assert!(parse_vector_literal("1,2,3").is_err());
        assert!(parse_vector_literal("[1,two,3]").is_err());
        assert_eq!(parse_vector_literal("[]").unwrap(), Vec::<f32>::new());
    }

    #[test]
    fn scores_are_clamped_to_unit_interval() {
        assert_eq!(clamp_score(-0.2), 0.0);
        assert_eq!(clamp_score(0.5), 0.5);
        assert_eq!(clamp_score(1.3), 1.0);
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_transient() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(|| {
            calls += 1;
            async { Err(Error::invalid("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_then_succeeds() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32> = retry_transient(|| {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Transient("flaky".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
