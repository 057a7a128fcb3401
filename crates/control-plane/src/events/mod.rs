//! Run event stream: envelopes, redaction, sequencing and SSE framing.

mod envelope;
pub mod redaction;
mod stream;
pub mod wire;

pub use envelope::{EventType, WorkflowStreamEventEnvelope, EVENT_VERSION};
pub use redaction::{RedactedContent, RedactionLevel};
pub use stream::{EventPayload, EventSink, EventStream};
