//! Server-sent event stream for a run.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::error::AppResult;
use crate::events::wire::resolve_last_seq;
use crate::events::WorkflowStreamEventEnvelope;
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Kept as text so an unparseable value falls back to the header.
    #[serde(default)]
    pub last_seq: Option<String>,
}

fn frame(envelope: &WorkflowStreamEventEnvelope) -> Result<Event, axum::Error> {
    Event::default()
        .id(envelope.seq.to_string())
        .event(envelope.event_type.as_str())
        .json_data(envelope)
}

/// `GET /api/runs/{run_id}/events`
///
/// Replays every event after the resolved `lastSeq`, then follows the run
/// live. The stream closes after the terminal event.
pub async fn stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let header = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok());
    let last_seq = resolve_last_seq(query.last_seq.as_deref(), header);

    let subscription = state.runs.subscribe(&run_id, last_seq).await?;
    tracing::debug!(run_id = %run_id, last_seq, "sse subscriber connected");

    let events = subscription
        .into_stream()
        .map(|envelope| frame(&envelope));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
