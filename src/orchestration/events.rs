//! Step events emitted on the NDJSON stream and mirrored to the hub

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::hub::EventKind;
use crate::model::{ToolCall, ToolResult};

/// Phase reported by a `status` event when a step parks for its client.
pub const PHASE_CLIENT_WAIT: &str = "CLIENT_WAIT";

/// Why a step emitted `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Done,
    MaxLoops,
}

/// Event body, tagged as `{"event": .., "data": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum StepEventBody {
    Started {
        step_id: String,
        #[serde(rename = "loop")]
        loop_count: u32,
    },
    Status {
        step_id: String,
        phase: String,
    },
    Decision {
        step_id: String,
        tool_calls: Vec<ToolCall>,
    },
    Tools {
        step_id: String,
        results: Vec<ToolResult>,
    },
    ClientCalls {
        step_id: String,
        calls: Vec<ToolCall>,
    },
    Assistant {
        step_id: String,
        text: String,
    },
    /// Conversation text rebuilt from memory by a replay
    Message {
        step_id: String,
        role: String,
        text: String,
    },
    Finished {
        step_id: String,
        #[serde(rename = "loop")]
        loop_count: u32,
        reason: FinishReason,
    },
    Error {
        step_id: String,
        message: String,
    },
}

/// One event of a step run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    #[serde(flatten)]
    pub body: StepEventBody,
    pub ts: DateTime<Utc>,
}

impl StepEvent {
    pub fn new(body: StepEventBody) -> Self {
        Self {
            body,
            ts: Utc::now(),
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match &self.body {
            StepEventBody::Started { .. } => "started",
            StepEventBody::Status { .. } => "status",
            StepEventBody::Decision { .. } => "decision",
            StepEventBody::Tools { .. } => "tools",
            StepEventBody::ClientCalls { .. } => "clientCalls",
            StepEventBody::Assistant { .. } => "assistant",
            StepEventBody::Message { .. } => "message",
            StepEventBody::Finished { .. } => "finished",
            StepEventBody::Error { .. } => "error",
        }
    }

    pub fn step_id(&self) -> &str {
        match &self.body {
            StepEventBody::Started { step_id, .. }
            | StepEventBody::Status { step_id, .. }
            | StepEventBody::Decision { step_id, .. }
            | StepEventBody::Tools { step_id, .. }
            | StepEventBody::ClientCalls { step_id, .. }
            | StepEventBody::Assistant { step_id, .. }
            | StepEventBody::Message { step_id, .. }
            | StepEventBody::Finished { step_id, .. }
            | StepEventBody::Error { step_id, .. } => step_id,
        }
    }

    /// Hub event type this event is mirrored as.
    pub fn hub_kind(&self) -> EventKind {
        match &self.body {
            StepEventBody::Started { .. } => EventKind::Started,
            StepEventBody::Status { .. } => EventKind::Status,
            StepEventBody::Decision { .. } => EventKind::Decision,
            StepEventBody::Tools { .. } => EventKind::Tools,
            StepEventBody::ClientCalls { .. } => EventKind::ClientCalls,
            StepEventBody::Assistant { .. } | StepEventBody::Message { .. } => EventKind::Message,
            StepEventBody::Finished { .. } => EventKind::Finished,
            StepEventBody::Error { .. } => EventKind::Error,
        }
    }

    /// The `data` object of the event.
    pub fn data(&self) -> Value {
        serde_json::to_value(&self.body)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(Value::take))
            .unwrap_or(Value::Null)
    }

    /// Payload published on the hub. Final assistant text is tagged so
    /// subscribers can tell it apart from raw token chunks.
    pub fn hub_payload(&self) -> Value {
        match &self.body {
            StepEventBody::Assistant { step_id, text } => json!({
                "type": "assistant",
                "stepId": step_id,
                "text": text,
            }),
            _ => self.data(),
        }
    }

    /// One NDJSON line, newline terminated.
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.body,
            StepEventBody::Finished { .. } | StepEventBody::Error { .. }
        ) || matches!(&self.body, StepEventBody::Status { phase, .. } if phase == PHASE_CLIENT_WAIT)
    }
}

impl From<StepEventBody> for StepEvent {
    fn from(body: StepEventBody) -> Self {
        Self::new(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndjson_shape() {
        let event = StepEvent::new(StepEventBody::Started {
            step_id: "s1".to_string(),
            loop_count: 0,
        });
        let line = event.to_ndjson_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["event"], json!("started"));
        assert_eq!(value["data"], json!({"stepId": "s1", "loop": 0}));
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_client_calls_name_and_kind() {
        let event = StepEvent::new(StepEventBody::ClientCalls {
            step_id: "s1".to_string(),
            calls: vec![],
        });
        assert_eq!(event.name(), "clientCalls");
        assert_eq!(event.hub_kind(), EventKind::ClientCalls);
        assert_eq!(serde_json::to_value(&event).unwrap()["event"], json!("clientCalls"));
    }

    #[test]
    fn test_assistant_mirrors_as_message() {
        let event = StepEvent::new(StepEventBody::Assistant {
            step_id: "s1".to_string(),
            text: "hi".to_string(),
        });
        assert_eq!(event.hub_kind(), EventKind::Message);
        assert_eq!(event.hub_payload()["type"], json!("assistant"));
        assert_eq!(event.data(), json!({"stepId": "s1", "text": "hi"}));
    }

    #[test]
    fn test_terminal_events() {
        let wait = StepEvent::new(StepEventBody::Status {
            step_id: "s1".to_string(),
            phase: PHASE_CLIENT_WAIT.to_string(),
        });
        assert!(wait.is_terminal());
        let finished = StepEvent::new(StepEventBody::Finished {
            step_id: "s1".to_string(),
            loop_count: 2,
            reason: FinishReason::MaxLoops,
        });
        assert!(finished.is_terminal());
        assert_eq!(finished.data()["reason"], json!("MAX_LOOPS"));
    }
}
