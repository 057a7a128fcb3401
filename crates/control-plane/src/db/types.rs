//! Rows persisted by the event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::engine::Checkpoint;
use crate::execir::ExecProgram;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Live runs can still produce events.
    pub fn is_live(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRun {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl StoredRun {
    /// A freshly started run with no events yet.
    pub fn started(run_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            error: None,
            last_seq: 0,
            updated_at: now,
        }
    }
}

/// Everything needed to resume a waiting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub program: ExecProgram,
    pub checkpoint: Checkpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_liveness() {
        assert!(RunStatus::Running.is_live());
        assert!(RunStatus::Waiting.is_live());
        assert!(RunStatus::Cancelled.is_terminal());
        assert_eq!(
            serde_json::to_value(RunStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }

    #[test]
    fn test_started_run() {
        let run = StoredRun::started("r1");
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.last_seq, 0);
        assert!(run.ended_at.is_none());
    }
}
