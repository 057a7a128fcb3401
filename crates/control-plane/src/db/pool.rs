//! Database connection pool management.

use crate::config::DatabaseConfig;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;

/// Type alias for the SQLite connection pool.
pub type DbPool = SqlitePool;

/// Idempotent schema, applied at startup.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        error TEXT,
        last_seq INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_events (
        run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        envelope TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (run_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_checkpoints (
        run_id TEXT PRIMARY KEY REFERENCES runs(run_id) ON DELETE CASCADE,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
];

/// Create a new database connection pool and bootstrap the schema.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let mut options = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));

    // Every connection to `:memory:` is a separate database; keep the one
    // connection alive for the pool's lifetime.
    if config.url.contains(":memory:") {
        options = options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = options.connect_with(config.connect_options()?).await?;
    bootstrap_schema(&pool).await?;

    tracing::info!(
        url = %config.url,
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub async fn bootstrap_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Check if the database connection is healthy.
pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pool_bootstraps_twice() {
        let pool = create_pool(&DatabaseConfig::in_memory()).await.unwrap();
        bootstrap_schema(&pool).await.unwrap();
        assert!(health_check(&pool).await);

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'run%'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 3);
    }
}
