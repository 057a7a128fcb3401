//! Event envelope and the closed set of event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Version stamped on every envelope.
pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.resumed")]
    RunResumed,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "llm.request")]
    LlmRequest,
    #[serde(rename = "llm.response")]
    LlmResponse,
    #[serde(rename = "validation.failed")]
    ValidationFailed,
    #[serde(rename = "repair.attempted")]
    RepairAttempted,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "trace")]
    Trace,
    #[serde(rename = "run.waiting")]
    RunWaiting,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
}

impl EventType {
    pub const ALL: [EventType; 17] = [
        EventType::RunStarted,
        EventType::RunResumed,
        EventType::StageStarted,
        EventType::StageCompleted,
        EventType::StageSkipped,
        EventType::StageFailed,
        EventType::LlmRequest,
        EventType::LlmResponse,
        EventType::ValidationFailed,
        EventType::RepairAttempted,
        EventType::ToolCall,
        EventType::ToolResult,
        EventType::Trace,
        EventType::RunWaiting,
        EventType::RunCompleted,
        EventType::RunFailed,
        EventType::RunCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunResumed => "run.resumed",
            EventType::StageStarted => "stage.started",
            EventType::StageCompleted => "stage.completed",
            EventType::StageSkipped => "stage.skipped",
            EventType::StageFailed => "stage.failed",
            EventType::LlmRequest => "llm.request",
            EventType::LlmResponse => "llm.response",
            EventType::ValidationFailed => "validation.failed",
            EventType::RepairAttempted => "repair.attempted",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::Trace => "trace",
            EventType::RunWaiting => "run.waiting",
            EventType::RunCompleted => "run.completed",
            EventType::RunFailed => "run.failed",
            EventType::RunCancelled => "run.cancelled",
        }
    }

    /// Terminal events end a run's live stream. `run.waiting` is not
    /// terminal: the run can be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::RunCompleted | EventType::RunFailed | EventType::RunCancelled
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// One event on a run's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStreamEventEnvelope {
    pub event_version: u32,
    pub run_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
}
