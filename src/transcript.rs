//! Ordered transcript of a session as pushed to the observer.
//!
//! The orchestrator writes events into a per-connection channel; a relay task
//! owned by the connection drains it into websocket frames. Sending never
//! waits on the observer.

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The closed set of event kinds an observer can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    System,
    User,
    AgentThought,
    ToolCall,
    ToolResult,
    NewImage,
    TurnStart,
    Error,
    SessionEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::System => "system",
            EventKind::User => "user",
            EventKind::AgentThought => "agent_thought",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::NewImage => "new_image",
            EventKind::TurnStart => "turn_start",
            EventKind::Error => "error",
            EventKind::SessionEnd => "session_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Text(String),
    Image { url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn text(kind: EventKind, content: impl Into<String>) -> Self {
        Self { kind, payload: EventPayload::Text(content.into()), timestamp: Utc::now() }
    }

    pub fn new_image(url: impl Into<String>) -> Self {
        Self {
            kind: EventKind::NewImage,
            payload: EventPayload::Image { url: url.into() },
            timestamp: Utc::now(),
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text(t) => Some(t),
            EventPayload::Image { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// `{"type": kind, "content": text, "timestamp": ..}`; images carry `url` in
// place of `content`.
impl Serialize for TranscriptEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("type", self.kind.as_str())?;
        match &self.payload {
            EventPayload::Text(t) => map.serialize_entry("content", t)?,
            EventPayload::Image { url } => map.serialize_entry("url", url)?,
        }
        map.serialize_entry("timestamp", &self.timestamp.to_rfc3339())?;
        map.end()
    }
}

/// Write side of a session's transcript.
///
/// Once `cancel` fires nothing more is delivered: a cancelled session has no
/// observer left, or has been superseded by a newer one on the same
/// connection.
#[derive(Debug, Clone)]
pub struct TranscriptSink {
    tx: mpsc::UnboundedSender<TranscriptEvent>,
    cancel: CancellationToken,
}

impl TranscriptSink {
    pub fn new(tx: mpsc::UnboundedSender<TranscriptEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Returns `false` when the event was suppressed or the relay is gone.
    pub fn emit(&self, event: TranscriptEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn emit_text(&self, kind: EventKind, content: impl Into<String>) -> bool {
        self.emit(TranscriptEvent::text(kind, content))
    }

    /// True once nothing emitted can reach an observer any more.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}
