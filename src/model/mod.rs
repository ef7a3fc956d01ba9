//! Tool call and tool result types shared by the store and the orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Where a tool call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecTarget {
    Server,
    Client,
}

/// A tool call decided by the model. Immutable once decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    pub exec_target: ExecTarget,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
        exec_target: ExecTarget,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            exec_target,
        }
    }

    /// Server call with arguments taken from a JSON object (anything else
    /// becomes an empty map).
    pub fn server(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::new(id, name, into_map(arguments), ExecTarget::Server)
    }

    pub fn client(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::new(id, name, into_map(arguments), ExecTarget::Client)
    }

    pub fn is_client(&self) -> bool {
        self.exec_target == ExecTarget::Client
    }

    /// Arguments as a JSON object value.
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }

    /// OpenAI `tool_calls[]` item: arguments rendered as a JSON string.
    pub fn to_openai(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments_value().to_string(),
            }
        })
    }
}

/// Parse tool arguments leniently: a JSON string is decoded, an object is
/// taken as is, and anything malformed yields an empty map.
pub fn parse_arguments(raw: Option<&Value>) -> Map<String, Value> {
    match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(text)) if !text.trim().is_empty() => {
            serde_json::from_str::<Value>(text)
                .ok()
                .map(into_map)
                .unwrap_or_default()
        }
        _ => Map::new(),
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    /// Served from the idempotency ledger
    #[serde(default)]
    pub reused: bool,
    pub status: ToolStatus,
    #[serde(default)]
    pub data: Value,
    /// `name::stableArgs` of the executed call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_key: Option<String>,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            reused: false,
            status: ToolStatus::Success,
            data,
            executed_key: None,
        }
    }

    /// Error result; `data` is `{"message": ...}`.
    pub fn error(
        call_id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            reused: false,
            status: ToolStatus::Error,
            data: json!({ "message": message.into() }),
            executed_key: None,
        }
    }

    pub fn with_reused(mut self, reused: bool) -> Self {
        self.reused = reused;
        self
    }

    pub fn with_executed_key(mut self, key: impl Into<String>) -> Self {
        self.executed_key = Some(key.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Error message of an error result.
    pub fn error_message(&self) -> Option<&str> {
        match self.status {
            ToolStatus::Error => self.data.get("message").and_then(Value::as_str),
            ToolStatus::Success => None,
        }
    }
}
