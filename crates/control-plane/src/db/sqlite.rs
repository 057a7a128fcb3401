//! SQLite-backed [`EventStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use super::pool::DbPool;
use super::store::{EventStore, StoreError};
use super::types::{ResumeState, RunStatus, StoredRun};
use crate::events::WorkflowStreamEventEnvelope;

#[derive(Debug, FromRow)]
struct RunRow {
    run_id: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
    last_seq: i64,
    updated_at: DateTime<Utc>,
}

impl From<RunRow> for StoredRun {
    fn from(row: RunRow) -> Self {
        Self {
            run_id: row.run_id,
            status: row.status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
            last_seq: row.last_seq.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

const RUN_COLUMNS: &str = "run_id, status, started_at, ended_at, error, last_seq, updated_at";

pub struct SqliteEventStore {
    pool: DbPool,
}

impl SqliteEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn create_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, status, started_at, ended_at, error, last_seq, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.run_id)
        .bind(run.status)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(&run.error)
        .bind(run.last_seq as i64)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::RunExists(run.run_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {} FROM runs WHERE run_id = ?", RUN_COLUMNS))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(StoredRun::from))
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let ended_at = status.is_terminal().then_some(now);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, error = ?, ended_at = ?, updated_at = ?
            WHERE run_id = ?
            "#,
        )
        .bind(status)
        .bind(error)
        .bind(ended_at)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        if status.is_terminal() {
            sqlx::query("DELETE FROM run_checkpoints WHERE run_id = ?")
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_event(&self, event: &WorkflowStreamEventEnvelope) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO run_events (run_id, seq, event_type, envelope, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.run_id)
        .bind(event.seq as i64)
        .bind(event.event_type.as_str())
        .bind(Json(event))
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE runs SET last_seq = MAX(last_seq, ?), updated_at = ? WHERE run_id = ?")
            .bind(event.seq as i64)
            .bind(Utc::now())
            .bind(&event.run_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
    ) -> Result<Vec<WorkflowStreamEventEnvelope>, StoreError> {
        let rows: Vec<(Json<WorkflowStreamEventEnvelope>,)> = sqlx::query_as(
            "SELECT envelope FROM run_events WHERE run_id = ? AND seq > ? ORDER BY seq ASC",
        )
        .bind(run_id)
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(envelope),)| envelope).collect())
    }

    async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<StoredRun>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {} FROM runs WHERE status = ? ORDER BY started_at ASC",
            RUN_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StoredRun::from).collect())
    }

    async fn prune_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM runs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND julianday(updated_at) < julianday(?)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn save_checkpoint(&self, run_id: &str, state: &ResumeState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_checkpoints (run_id, state, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(Json(state))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_resume(&self, run_id: &str) -> Result<Option<ResumeState>, StoreError> {
        let row: Option<(Json<ResumeState>,)> =
            sqlx::query_as("SELECT state FROM run_checkpoints WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(state),)| state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::pool::create_pool;
    use crate::db::store::contract;

    async fn store() -> SqliteEventStore {
        SqliteEventStore::new(create_pool(&DatabaseConfig::in_memory()).await.unwrap())
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        contract::run_lifecycle(&store().await).await;
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        contract::append_is_idempotent(&store().await).await;
    }

    #[tokio::test]
    async fn test_prune_cascades() {
        contract::prune_cascades(&store().await).await;
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        contract::checkpoint_round_trip(&store().await).await;
    }

    #[tokio::test]
    async fn test_event_requires_run() {
        let store = store().await;
        let err = store
            .append_event(&contract::envelope("ghost", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
