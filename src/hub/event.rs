//! Outbound hub events and their SSE rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SSE event names carried by a step channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A step run began
    Started,
    /// Phase change, e.g. `CLIENT_WAIT`
    Status,
    /// The model chose tool calls
    Decision,
    /// Server tool results
    Tools,
    /// Calls handed to the client
    ClientCalls,
    /// Streamed tokens and the final answer
    Message,
    /// Terminal failure
    Error,
    /// Heartbeat
    Ping,
    /// Terminal success
    Finished,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Status => "status",
            EventKind::Decision => "decision",
            EventKind::Tools => "tools",
            EventKind::ClientCalls => "clientCalls",
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Ping => "ping",
            EventKind::Finished => "finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of the `message` event that ends one forwarded token stream.
pub const DONE_MARKER: &str = "[DONE]";

/// One event on a step channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl HubEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            ts: Utc::now(),
        }
    }

    /// A forwarded token chunk.
    pub fn token(chunk: impl Into<String>) -> Self {
        Self::new(EventKind::Message, Value::String(chunk.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, serde_json::json!({ "message": message.into() }))
    }

    pub fn done_marker() -> Self {
        Self::token(DONE_MARKER)
    }

    pub fn is_done_marker(&self) -> bool {
        self.kind == EventKind::Message && self.payload.as_str() == Some(DONE_MARKER)
    }

    /// `data` text: strings verbatim, everything else as compact JSON.
    pub fn data(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// `event: <name>\ndata: <payload>\n\n`, one `data:` line per payload line.
    pub fn to_sse_frame(&self) -> String {
        let mut frame = format!("event: {}\n", self.kind);
        for line in self.data().split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }
}
