//! Per-run event factory.

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::envelope::{EventType, WorkflowStreamEventEnvelope, EVENT_VERSION};
use super::redaction::{sanitize, RedactedContent};

/// Fields naming graph structure. These are authored identifiers and are
/// never value-redacted.
const IDENTIFIER_FIELDS: &[&str] = &["nodeId", "entryNode", "op", "tool", "modelClass"];

/// Where a run's envelopes go once built.
pub type EventSink = mpsc::UnboundedSender<WorkflowStreamEventEnvelope>;

/// Payload builder. Every field is redacted as it is added.
#[derive(Debug, Clone, Default)]
pub struct EventPayload {
    fields: Map<String, Value>,
}

impl EventPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain field, passed through the key-pattern sanitizer unless it is
    /// one of the structural identifiers.
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let value = if IDENTIFIER_FIELDS.contains(&name) {
            value
        } else {
            sanitize(&value)
        };
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Field wrapped in a partial [`RedactedContent`] summary.
    pub fn sensitive(mut self, name: &str, value: &Value) -> Self {
        self.fields
            .insert(name.to_string(), RedactedContent::partial(value).to_value());
        self
    }

    /// Field replaced by a full [`RedactedContent`] placeholder.
    pub fn opaque(mut self, name: &str, reason: &str) -> Self {
        self.fields
            .insert(name.to_string(), RedactedContent::full(reason).to_value());
        self
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Owns one run's sequence counter.
///
/// Sequence numbers start at `initial_seq + 1` and increase by exactly one
/// per emitted event.
#[derive(Debug)]
pub struct EventStream {
    run_id: String,
    next_seq: u64,
    sink: EventSink,
}

impl EventStream {
    pub fn new(run_id: impl Into<String>, initial_seq: u64, sink: EventSink) -> Self {
        Self {
            run_id: run_id.into(),
            next_seq: initial_seq + 1,
            sink,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Seq of the most recent event, or the initial seq if none were emitted.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn emit(&mut self, event_type: EventType, payload: EventPayload) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let envelope = WorkflowStreamEventEnvelope {
            event_version: EVENT_VERSION,
            run_id: self.run_id.clone(),
            seq,
            timestamp: Utc::now(),
            event_type,
            payload: payload.into_value(),
        };
        if self.sink.send(envelope).is_err() {
            debug!(run_id = %self.run_id, seq, "event sink closed, dropping event");
        }
        seq
    }
}
