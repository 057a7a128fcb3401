//! In-memory [`EventStore`] for tests and ephemeral servers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::store::{EventStore, StoreError};
use super::types::{ResumeState, RunStatus, StoredRun};
use crate::events::WorkflowStreamEventEnvelope;

#[derive(Debug)]
struct Entry {
    run: StoredRun,
    events: BTreeMap<u64, WorkflowStreamEventEnvelope>,
    resume: Option<ResumeState>,
}

#[derive(Debug, Default)]
pub struct MemoryEventStore {
    runs: RwLock<HashMap<String, Entry>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_run(&self, run: &StoredRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::RunExists(run.run_id.clone()));
        }
        runs.insert(
            run.run_id.clone(),
            Entry {
                run: run.clone(),
                events: BTreeMap::new(),
                resume: None,
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError> {
        Ok(self.runs.read().await.get(run_id).map(|e| e.run.clone()))
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;

        let now = Utc::now();
        entry.run.status = status;
        entry.run.error = error.map(str::to_string);
        entry.run.ended_at = status.is_terminal().then_some(now);
        entry.run.updated_at = now;
        if status.is_terminal() {
            entry.resume = None;
        }
        Ok(())
    }

    async fn append_event(&self, event: &WorkflowStreamEventEnvelope) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(&event.run_id)
            .ok_or_else(|| StoreError::RunNotFound(event.run_id.clone()))?;

        if entry.events.contains_key(&event.seq) {
            return Ok(false);
        }
        entry.events.insert(event.seq, event.clone());
        entry.run.last_seq = entry.run.last_seq.max(event.seq);
        entry.run.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: u64,
    ) -> Result<Vec<WorkflowStreamEventEnvelope>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|e| {
                e.events
                    .range(after_seq.saturating_add(1)..)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_runs_with_status(&self, status: RunStatus) -> Result<Vec<StoredRun>, StoreError> {
        let mut runs: Vec<StoredRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|e| e.run.status == status)
            .map(|e| e.run.clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn prune_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, e| !(e.run.status.is_terminal() && e.run.updated_at < cutoff));
        Ok((before - runs.len()) as u64)
    }

    async fn save_checkpoint(&self, run_id: &str, state: &ResumeState) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        entry.resume = Some(state.clone());
        Ok(())
    }

    async fn load_resume(&self, run_id: &str) -> Result<Option<ResumeState>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .and_then(|e| e.resume.clone()))
    }
}
