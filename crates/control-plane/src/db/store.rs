//! Durable event store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::{ResumeState, RunStatus, StoredRun};
use crate::events::WorkflowStreamEventEnvelope;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already exists: {0}")]
    RunExists(String),
}

/// Persistence for runs, their events and resume state.
///
/// The store is the single source of truth across restarts: everything
/// the run manager keeps in memory can be rebuilt from it.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn create_run(&self, run: &StoredRun) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError>;

    /// Set status and error. Terminal statuses also stamp `ended_at`.
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Append one event. Returns `false` when `(run_id, seq)` already exists.
    async fn append_event(&self, event: &WorkflowStreamEventEnvelope) -> Result<bool, StoreError>;

    /// Events with `seq > after_seq`, ascending.
    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
    ) -> Result<Vec<WorkflowStreamEventEnvelope>, StoreError>;

    async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<StoredRun>, StoreError>;

    /// Delete terminal runs last updated before `cutoff`, with their events.
    /// Returns the number of runs removed.
    async fn prune_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn save_checkpoint(&self, run_id: &str, state: &ResumeState) -> Result<(), StoreError>;

    async fn load_resume(&self, run_id: &str) -> Result<Option<ResumeState>, StoreError>;
}
