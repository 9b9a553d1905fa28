//! End-to-end scenarios against a real pgvector-enabled Postgres.
//!
//! Gated on `TESTLENS_TEST_DSN`; without it every test here is a no-op, so
//! the suite stays green on machines without a store. Run with e.g.:
//!
//! ```bash
//! TESTLENS_TEST_DSN=postgres://localhost/testlens_test cargo test --test engine_e2e
//! ```
//!
//! The scenarios run inside a single test to keep store state deterministic.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use testlens::config::{
    Config, EmbeddingConfig, IngestConfig, RetrievalConfig, ServerConfig, StoreConfig,
};
use testlens::db;
use testlens::embedding::Embedder;
use testlens::error::Error;
use testlens::filter::SearchFilters;
use testlens::ingest::{Checkpoint, CheckpointCounters, Ingestor, UidLocks};
use testlens::migrate;
use testlens::models::{TestDoc, TestStep};
use testlens::search::{Scope, SearchEngine};
use testlens::store::VectorStore;

/// The tests share one database; serialise them so DDL tricks and cleanup
/// in one scenario never interleave with another.
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

fn test_config(tmp: &TempDir) -> Option<Config> {
    let dsn = std::env::var("TESTLENS_TEST_DSN").ok()?;
    Some(Config {
        store: StoreConfig { dsn, pool_size: 5 },
        embedding: EmbeddingConfig {
            provider: "hashed".to_string(),
            dims: Some(256),
            ..EmbeddingConfig::default()
        },
        retrieval: RetrievalConfig::default(),
        ingest: IngestConfig {
            chunk_size: 2,
            parallelism: 2,
            checkpoint_path: tmp.path().join("checkpoint.json"),
            chunk_timeout_secs: 60,
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            search_timeout_secs: 10,
            shutdown_grace_secs: 5,
            search_rate_per_min: 1000,
            ingest_rate_per_min: 1000,
        },
    })
}

fn corpus() -> Vec<serde_json::Value> {
    vec![
        json!({
            "title": "login page loads",
            "jiraKey": "TL-A",
            "priority": "High",
            "tags": ["auth"],
            "platforms": ["web"],
            "testSteps": [
                {"action": "enter username", "expectedResult": "username accepted"},
                {"action": "click submit", "expectedResult": "login succeeds"}
            ]
        }),
        json!({
            "title": "reset password",
            "jiraKey": "TL-B",
            "priority": "Medium",
            "tags": ["auth"],
            "testSteps": [
                {"action": "click forgot link", "expectedResult": "email sent"}
            ]
        }),
        json!({
            "title": "signup form validation",
            "jiraKey": "TL-C",
            "priority": "Medium",
            "tags": ["forms"],
            "testSteps": []
        }),
    ]
}

#[tokio::test]
async fn end_to_end_scenarios() {
    let tmp = TempDir::new().unwrap();
    let Some(config) = test_config(&tmp) else {
        eprintln!("skipping engine_e2e: TESTLENS_TEST_DSN not set");
        return;
    };
    let _db = DB_LOCK.lock().await;

    migrate::run_migrations(&config).await.unwrap();

    let pool = db::connect(&config).await.unwrap();
    let store = VectorStore::new(pool);
    sqlx::query("DELETE FROM test_docs")
        .execute(store.pool())
        .await
        .unwrap();

    let embedder = Embedder::new(&config.embedding).unwrap();
    let engine = SearchEngine::new(store.clone(), embedder.clone(), config.retrieval.clone());
    let ingestor = Ingestor::new(
        store.clone(),
        embedder.clone(),
        config.ingest.clone(),
        Arc::new(UidLocks::new()),
    );

    // ---- Scenario: basic search with step annotation ----

    let report = ingestor.run("seed", corpus()).await.unwrap();
    assert_eq!(report.docs_written, 3);
    assert_eq!(report.steps_written, 3);
    assert_eq!(report.skipped, 0);

    let outcome = engine
        .search("user login", Some(2), &SearchFilters::default(), Scope::All)
        .await
        .unwrap();
    assert_eq!(outcome.hits.len(), 2);
    assert_eq!(outcome.hits[0].uid, "TL-A", "most related test ranks first");
    assert!(
        outcome.hits[0].matched_step_indices.contains(&1),
        "step annotations should include step 1, got {:?}",
        outcome.hits[0].matched_step_indices
    );
    assert!(outcome.warning.is_none());
    assert_eq!(outcome.hits[0].doc.steps.len(), 2, "payload carries steps");

    // top_k = 1 returns exactly one hit.
    let one = engine
        .search("user login", Some(1), &SearchFilters::default(), Scope::All)
        .await
        .unwrap();
    assert_eq!(one.hits.len(), 1);

    // ---- Scenario: filter push-down ----

    let filters = SearchFilters {
        priority: Some("High".to_string()),
        ..SearchFilters::default()
    };
    let outcome = engine
        .search("user login", Some(5), &filters, Scope::All)
        .await
        .unwrap();
    let uids: Vec<&str> = outcome.hits.iter().map(|h| h.uid.as_str()).collect();
    assert_eq!(uids, vec!["TL-A"], "only the High-priority doc survives");

    // A filter that excludes everything yields an empty list, not an error.
    let filters = SearchFilters {
        tags: Some(vec!["nonexistent-tag".to_string()]),
        ..SearchFilters::default()
    };
    let outcome = engine
        .search("user login", Some(5), &filters, Scope::All)
        .await
        .unwrap();
    assert!(outcome.hits.is_empty());

    // ---- Scenario: idempotent re-ingest ----

    let counts_before = store.counts().await.unwrap();
    let report = ingestor.run("seed", corpus()).await.unwrap();
    assert!(report.steps_written > 0, "steps rewritten on re-ingest");
    let counts_after = store.counts().await.unwrap();
    assert_eq!(counts_before.doc_count, counts_after.doc_count);
    assert_eq!(counts_before.step_count, counts_after.step_count);

    // ingested_at never moves backwards across re-ingests (and moved forward
    // here, since the second run embedded fresh timestamps).
    let doc = store.fetch_doc("TL-A").await.unwrap().unwrap();
    assert_eq!(doc.steps.len(), 2);

    // ---- Scenario: docs scope ignores the step tier ----

    let outcome = engine
        .search("user login", Some(3), &SearchFilters::default(), Scope::Docs)
        .await
        .unwrap();
    assert!(outcome
        .hits
        .iter()
        .all(|h| h.matched_step_indices.is_empty()));
    assert_eq!(outcome.hits[0].uid, "TL-A");

    // ---- Scenario: find similar to a reference test ----

    let extra = vec![
        json!({
            "title": "login page rendering",
            "jiraKey": "TL-A2",
            "priority": "Medium",
            "tags": ["auth"],
            "testSteps": []
        }),
        json!({
            "title": "database migration rollback",
            "jiraKey": "TL-X",
            "priority": "Medium",
            "tags": ["infra"],
            "testSteps": []
        }),
    ];
    ingestor.run("seed-extra", extra).await.unwrap();

    let outcome = engine.similar("TL-A", Some(1), Scope::All).await.unwrap();
    assert_eq!(outcome.hits.len(), 1);
    assert_eq!(
        outcome.hits[0].uid, "TL-A2",
        "the paraphrase wins, never the reference itself"
    );

    // Similar-to also resolves via external key and reports missing refs.
    let err = engine
        .similar("TL-MISSING", Some(1), Scope::All)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    // ---- Scenario: direct lookup by external key ----

    let doc = engine.lookup_by_key("TL-B").await.unwrap();
    assert_eq!(doc.uid, "TL-B");
    assert_eq!(doc.steps.len(), 1);

    let err = engine.lookup_by_key("TL-NOPE").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    // ---- Scenario: checkpoint resume ----

    let all_records: Vec<serde_json::Value> = (0..20)
        .map(|i| {
            json!({
                "title": format!("checkpoint case {} widget", i),
                "jiraKey": format!("CP-{}", i),
                "testSteps": [{"action": format!("perform step {}", i)}]
            })
        })
        .collect();

    // First half lands normally (chunks 0..=4 with chunk_size 2)…
    let first = ingestor
        .run("cp-src", all_records[..10].to_vec())
        .await
        .unwrap();
    assert_eq!(first.docs_written, 10);

    // …then simulate a crash that left a checkpoint pointing past chunk 4.
    let mut checkpoint = Checkpoint {
        source_id: "cp-src".to_string(),
        last_chunk_completed: 4,
        deferred_chunks: Vec::new(),
        counters: CheckpointCounters {
            docs_in: 10,
            docs_written: 10,
            steps_written: 10,
            skipped: 0,
        },
        started_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    checkpoint.save(&config.ingest.checkpoint_path).unwrap();

    let resumed = ingestor.run("cp-src", all_records.clone()).await.unwrap();
    assert_eq!(
        resumed.docs_written, 20,
        "resume processes only chunks 5..=9 on top of checkpointed counters"
    );

    let cp_docs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM test_docs WHERE uid LIKE 'CP-%'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(cp_docs, 20, "final state matches an uninterrupted run");
    let cp_steps: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM test_steps WHERE parent_uid LIKE 'CP-%'")
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(cp_steps, 20);
    assert!(
        !config.ingest.checkpoint_path.exists(),
        "checkpoint cleared after a clean finish"
    );

    // ---- Property: deleting a doc deletes its steps ----

    let removed = store.delete_doc("CP-0").await.unwrap();
    assert_eq!(removed, 1);
    let orphan_steps = store.fetch_steps_by_parent("CP-0").await.unwrap();
    assert!(orphan_steps.is_empty(), "steps cascade with their parent");

    // ---- Adapter-level upserts ----

    let adapter_doc = TestDoc {
        uid: "ADP-1".to_string(),
        external_key: None,
        title: "adapter level upsert".to_string(),
        description: None,
        priority: None,
        test_type: None,
        platforms: vec![],
        tags: vec![],
        folder_path: vec![],
        related_keys: vec![],
        steps: vec![],
        source: "adapter".to_string(),
        ingested_at: chrono::Utc::now(),
    };
    let doc_vector = embedder.embed_one("adapter level upsert").await.unwrap();
    store
        .upsert_docs(&[(adapter_doc, doc_vector)])
        .await
        .unwrap();

    let step = TestStep {
        index: 1,
        action: "probe the adapter".to_string(),
        data: None,
        expected: vec![],
    };
    let step_vector = embedder.embed_one("probe the adapter").await.unwrap();
    store
        .upsert_steps("ADP-1", &[(step, step_vector)])
        .await
        .unwrap();

    let fetched = store.fetch_doc("ADP-1").await.unwrap().unwrap();
    assert_eq!(fetched.steps.len(), 1);
    store.delete_doc("ADP-1").await.unwrap();

    // ---- Scenario: partial failure of the step tier ----
    // Breaking the step table makes the step fan-out fail while the doc
    // tier still answers; the search degrades with a soft warning.

    sqlx::query("ALTER TABLE test_steps RENAME TO test_steps_broken")
        .execute(store.pool())
        .await
        .unwrap();

    let outcome = engine
        .search("user login", Some(2), &SearchFilters::default(), Scope::All)
        .await
        .unwrap();
    assert!(outcome.warning.is_some(), "degradation must be surfaced");
    assert!(!outcome.hits.is_empty(), "doc-tier results still returned");
    assert!(outcome
        .hits
        .iter()
        .all(|h| h.matched_step_indices.is_empty()));

    sqlx::query("ALTER TABLE test_steps_broken RENAME TO test_steps")
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_records_are_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let Some(config) = test_config(&tmp) else {
        return;
    };
    let _db = DB_LOCK.lock().await;

    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&config.embedding).unwrap();
    let ingestor = Ingestor::new(
        store.clone(),
        embedder,
        config.ingest.clone(),
        Arc::new(UidLocks::new()),
    );

    let records = vec![
        json!({"title": "mixed batch survivor", "jiraKey": "MB-1", "testSteps": []}),
        json!({"bogus": true}),
    ];
    let report = ingestor.run("mixed", records).await.unwrap();
    assert_eq!(report.docs_written, 1);
    assert_eq!(report.skipped, 1);
    assert!(report.warnings.iter().any(|w| w.contains("skipped")));

    store.delete_doc("MB-1").await.unwrap();
}

#[tokio::test]
async fn lookup_conflict_on_duplicate_external_key() {
    let tmp = TempDir::new().unwrap();
    let Some(config) = test_config(&tmp) else {
        return;
    };
    let _db = DB_LOCK.lock().await;

    migrate::run_migrations(&config).await.unwrap();
    let pool = db::connect(&config).await.unwrap();
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&config.embedding).unwrap();
    let engine = SearchEngine::new(store.clone(), embedder.clone(), config.retrieval.clone());
    let ingestor = Ingestor::new(
        store.clone(),
        embedder,
        config.ingest.clone(),
        Arc::new(UidLocks::new()),
    );

    // Two docs with distinct uids but the same external key.
    let records = vec![
        json!({"uid": "DUP-1", "title": "duplicate key one", "jiraKey": "DUP-KEY", "testSteps": []}),
        json!({"uid": "DUP-2", "title": "duplicate key two", "jiraKey": "DUP-KEY", "testSteps": []}),
    ];
    ingestor.run("dup", records).await.unwrap();

    let err = engine.lookup_by_key("DUP-KEY").await.unwrap_err();
    match err {
        Error::Conflict(_) => {}
        other => panic!("expected Conflict, got {:?}", other),
    }

    store.delete_doc("DUP-1").await.unwrap();
    store.delete_doc("DUP-2").await.unwrap();
}
