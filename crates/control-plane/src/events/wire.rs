//! Server-sent event framing.
//!
//! Frames are `id: <seq>\nevent: <type>\ndata: <json envelope>\n\n`.

use super::envelope::WorkflowStreamEventEnvelope;

pub fn encode_frame(envelope: &WorkflowStreamEventEnvelope) -> Result<String, serde_json::Error> {
    Ok(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        envelope.seq,
        envelope.event_type,
        serde_json::to_string(envelope)?
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn envelope(&self) -> Result<WorkflowStreamEventEnvelope, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Incremental frame parser for a chunked SSE body.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() && frame.id.is_none() && frame.event.is_none() {
        return None;
    }
    frame.data = data.join("\n");
    Some(frame)
}

/// Seq a reconnecting subscriber has already seen.
///
/// A parseable `lastSeq` query parameter wins, then a parseable
/// `Last-Event-ID` header, then 0.
pub fn resolve_last_seq(query: Option<&str>, header: Option<&str>) -> u64 {
    query
        .and_then(|q| q.trim().parse().ok())
        .or_else(|| header.and_then(|h| h.trim().parse().ok()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use chrono::Utc;
    use serde_json::json;

    fn envelope(seq: u64) -> WorkflowStreamEventEnvelope {
        WorkflowStreamEventEnvelope {
            event_version: 1,
            run_id: "r1".to_string(),
            seq,
            timestamp: Utc::now(),
            event_type: EventType::StageStarted,
            payload: json!({"nodeId": "a"}),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(&envelope(4)).unwrap();
        assert!(frame.starts_with("id: 4\nevent: stage.started\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
    }

    #[test]
    fn test_parse_split_chunks() {
        let text = format!("{}{}", encode_frame(&envelope(1)).unwrap(), encode_frame(&envelope(2)).unwrap());
        let (head, tail) = text.split_at(text.len() / 2 + 3);

        let mut parser = SseParser::new();
        let mut frames = parser.push(head);
        frames.extend(parser.push(tail));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].id.as_deref(), Some("2"));
        assert_eq!(frames[1].event.as_deref(), Some("stage.started"));
        let parsed = frames[1].envelope().unwrap();
        assert_eq!(parsed.seq, 2);
        assert_eq!(parsed.payload, json!({"nodeId": "a"}));
    }

    #[test]
    fn test_parse_ignores_comments() {
        let mut parser = SseParser::new();
        assert!(parser.push(": keep-alive\n\n").is_empty());
        let frames = parser.push("event: x\r\ndata: a\r\ndata: b\r\n\r\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn test_reconnect_precedence() {
        assert_eq!(resolve_last_seq(Some("5"), Some("9")), 5);
        assert_eq!(resolve_last_seq(None, Some("9")), 9);
        assert_eq!(resolve_last_seq(Some("abc"), Some("9")), 9);
        assert_eq!(resolve_last_seq(None, None), 0);
        assert_eq!(resolve_last_seq(Some("0"), Some("9")), 0);
    }
}
