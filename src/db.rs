use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};

/// Build the shared Postgres connection pool, sized from `store.pool_size`.
///
/// Connections open lazily: input validation and normalisation can run (and
/// fail fast) without a reachable store, and reachability is reported through
/// health checks rather than at startup.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.store.pool_size)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(&config.store.dsn)
        .map_err(|e| Error::FatalConfig(format!("invalid store DSN: {}", e)))?;

    Ok(pool)
}
