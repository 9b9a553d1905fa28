//! CLI display for direct test lookup.

use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::TestDoc;
use crate::search::SearchEngine;
use crate::store::VectorStore;

/// Look up a test by external key (falling back to uid) and print it.
pub async fn run_get(config: &Config, key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::invalid("key must not be empty"));
    }

    let pool = db::connect(config).await?;
    let store = VectorStore::new(pool);
    let embedder = Embedder::new(&config.embedding)?;
    let engine = SearchEngine::new(store.clone(), embedder, config.retrieval.clone());

    let doc = match engine.lookup_by_key(key).await {
        Ok(doc) => doc,
        Err(Error::NotFound(_)) => store
            .fetch_doc(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no test with key or uid '{}'", key)))?,
        Err(err) => return Err(err),
    };

    print_doc(&doc);
    store.pool().close().await;
    Ok(())
}

fn print_doc(doc: &TestDoc) {
    println!("Test {}", doc.uid);
    println!("  title:       {}", doc.title);
    if let Some(key) = &doc.external_key {
        println!("  key:         {}", key);
    }
    if let Some(priority) = doc.priority {
        println!("  priority:    {}", priority.as_str());
    }
    if let Some(test_type) = &doc.test_type {
        println!("  type:        {}", test_type);
    }
    if !doc.tags.is_empty() {
        println!("  tags:        {}", doc.tags.join(", "));
    }
    if !doc.platforms.is_empty() {
        println!("  platforms:   {}", doc.platforms.join(", "));
    }
    if !doc.folder_path.is_empty() {
        println!("  folder:      {}", doc.folder_path.join("/"));
    }
    if !doc.related_keys.is_empty() {
        println!("  related:     {}", doc.related_keys.join(", "));
    }
    println!("  source:      {}", doc.source);
    println!("  ingested at: {}", doc.ingested_at.to_rfc3339());
    if let Some(description) = &doc.description {
        println!();
        println!("  {}", description.replace('\n', "\n  "));
    }
    if !doc.steps.is_empty() {
        println!();
        println!("  Steps:");
        for step in &doc.steps {
            println!("    {}. {}", step.index, step.action);
            if let Some(data) = &step.data {
                println!("       data: {}", data);
            }
            for expected in &step.expected {
                println!("       expect: {}", expected);
            }
        }
    }
}
