//! Store statistics overview.
//!
//! Prints doc/step counts with per-source and per-priority breakdowns.
//! Used by `tlx stats` to confirm that ingestion runs landed as expected.

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::store::VectorStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = VectorStore::new(pool);
    let counts = store.counts().await?;

    println!("Testlens — Store Stats");
    println!("======================");
    println!();
    println!("  Documents: {}", counts.doc_count);
    println!("  Steps:     {}", counts.step_count);

    if !counts.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<32} {:>8}", "SOURCE", "DOCS");
        println!("  {}", "-".repeat(42));
        for (source, n) in &counts.by_source {
            println!("  {:<32} {:>8}", source, n);
        }
    }

    if !counts.by_priority.is_empty() {
        println!();
        println!("  By priority:");
        println!("  {:<32} {:>8}", "PRIORITY", "DOCS");
        println!("  {}", "-".repeat(42));
        for (priority, n) in &counts.by_priority {
            println!("  {:<32} {:>8}", priority, n);
        }
    }

    println!();
    store.pool().close().await;
    Ok(())
}
