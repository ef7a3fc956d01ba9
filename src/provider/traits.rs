//! Chat provider abstraction.
//!
//! The orchestrator only needs two things from a model: a single completion
//! shaped like `choices[0].message`, and a stream of raw delta chunks.

use anyhow::Result;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// Raw provider chunks, each the JSON text of one SSE `data:` payload.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Request payload sent to the provider (OpenAI-compatible).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    /// `"auto"` or `"none"`
    #[serde(rename = "toolChoice", skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    /// Server tool schemas
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    /// Tool schemas executed by the remote client
    #[serde(rename = "clientTools", default, skip_serializing_if = "Vec::is_empty")]
    pub client_tools: Vec<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    pub fn with_tool_choice(mut self, choice: impl Into<String>) -> Self {
        self.tool_choice = Some(choice.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>, client_tools: Vec<Value>) -> Self {
        self.tools = tools;
        self.client_tools = client_tools;
        self
    }

    /// Body in the wire shape of an OpenAI chat completion request.
    pub fn to_openai_body(&self, stream: bool) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": self.messages,
            "stream": stream,
        });
        let tools: Vec<Value> = self
            .tools
            .iter()
            .chain(self.client_tools.iter())
            .cloned()
            .collect();
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(choice) = &self.tool_choice {
            body["tool_choice"] = Value::String(choice.clone());
        }
        body
    }
}

/// A model endpoint.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    /// Single completion; the raw response body.
    async fn complete(&self, request: &ChatRequest) -> Result<Value>;

    /// Open a streaming completion.
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream>;

    /// Provider name for logging
    fn provider_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_openai_body_merges_tools() {
        let request = ChatRequest::new("m", vec![json!({"role": "user", "content": "hi"})])
            .with_tool_choice("auto")
            .with_tools(vec![json!({"name": "search"})], vec![json!({"name": "pick"})]);
        let body = request.to_openai_body(true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["tool_choice"], json!("auto"));
        assert_eq!(body["tools"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_payload_shape() {
        let request = ChatRequest::new("m", vec![]).with_tool_choice("none");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"model": "m", "messages": [], "toolChoice": "none"}));
    }
}
