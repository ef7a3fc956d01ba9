//! Pure fold over provider delta chunks.
//!
//! Chunks are OpenAI-style `{"choices":[{"delta":{...}}]}` objects, or a bare
//! delta object. Content and reasoning text append; tool-call fragments are
//! keyed by `index`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Arguments state of one tool call being streamed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCallAccumulator {
    /// Call id, from the first delta that carried one
    pub id: Option<String>,
    /// Function name, from the first delta that carried one
    pub name: Option<String>,
    /// Raw argument text as received
    pub raw_arguments: String,
    /// Last successful parse of `raw_arguments`
    pub resolved: Option<Map<String, Value>>,
}

impl ToolCallAccumulator {
    fn push_arguments(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(fragment) {
            Ok(Value::Object(map)) => {
                self.raw_arguments = fragment.to_string();
                self.resolved = Some(map);
            }
            _ => {
                self.raw_arguments.push_str(fragment);
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&self.raw_arguments)
                {
                    self.resolved = Some(map);
                }
            }
        }
    }

    /// Resolved arguments, empty when nothing ever parsed.
    pub fn arguments(&self) -> Map<String, Value> {
        self.resolved.clone().unwrap_or_default()
    }
}

/// Folded state of one provider stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    /// Concatenated `delta.content`
    pub content: String,
    /// Concatenated `delta.reasoning_content`
    pub reasoning: String,
    /// Tool calls keyed by their stream index
    pub tools: BTreeMap<u64, ToolCallAccumulator>,
    /// Chunks folded so far, including unparseable ones
    pub chunks: u64,
    /// Set once the upstream ended or failed
    pub finished: bool,
    /// Upstream failure message
    pub error: Option<String>,
}

/// Fold one raw chunk into the accumulator.
pub fn fold(mut acc: Accumulator, chunk: &str) -> Accumulator {
    acc.chunks += 1;
    let value: Value = match serde_json::from_str(chunk) {
        Ok(v) => v,
        Err(_) => return acc,
    };
    let delta = match value.pointer("/choices/0") {
        Some(choice) => choice
            .get("delta")
            .or_else(|| choice.get("message"))
            .cloned()
            .unwrap_or(Value::Null),
        None => value,
    };
    let delta = match delta {
        Value::Object(map) => map,
        _ => return acc,
    };

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        acc.content.push_str(text);
    }
    if let Some(text) = delta
        .get("reasoning_content")
        .or_else(|| delta.get("reasoning"))
        .and_then(Value::as_str)
    {
        acc.reasoning.push_str(text);
    }

    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            let slot = acc.tools.entry(index).or_default();
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                if !id.trim().is_empty() {
                    slot.id = Some(id.to_string());
                }
            }
            if let Some(function) = call.get("function") {
                if let Some(name) = function.get("name").and_then(Value::as_str) {
                    if !name.trim().is_empty() {
                        slot.name = Some(name.to_string());
                    }
                }
                match function.get("arguments") {
                    Some(Value::String(fragment)) => slot.push_arguments(fragment),
                    Some(obj @ Value::Object(_)) => slot.push_arguments(&obj.to_string()),
                    _ => {}
                }
            }
        }
    }
    acc
}

/// A tool call with fully assembled arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedToolCall {
    /// Position in the streamed `tool_calls` array
    pub index: u64,
    pub id: Option<String>,
    /// Empty when no delta named the function
    pub name: String,
    pub arguments: Map<String, Value>,
    pub raw_arguments: String,
}

/// Converged value of a stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregated {
    /// Full answer text
    pub content: String,
    /// Full reasoning text
    pub reasoning: String,
    /// Tool calls in index order
    pub tool_calls: Vec<AggregatedToolCall>,
    /// Upstream error, if the stream failed
    pub error: Option<String>,
}

impl Aggregated {
    /// Content text, or the reasoning text when no content arrived.
    pub fn final_text(&self) -> &str {
        if self.content.trim().is_empty() && !self.reasoning.trim().is_empty() {
            &self.reasoning
        } else {
            &self.content
        }
    }
}

impl From<&Accumulator> for Aggregated {
    fn from(acc: &Accumulator) -> Self {
        Self {
            content: acc.content.clone(),
            reasoning: acc.reasoning.clone(),
            tool_calls: acc
                .tools
                .iter()
                .map(|(index, t)| AggregatedToolCall {
                    index: *index,
                    id: t.id.clone(),
                    name: t.name.clone().unwrap_or_default(),
                    arguments: t.arguments(),
                    raw_arguments: t.raw_arguments.clone(),
                })
                .collect(),
            error: acc.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(chunks: &[Value]) -> Accumulator {
        chunks
            .iter()
            .fold(Accumulator::default(), |acc, c| fold(acc, &c.to_string()))
    }

    fn args_chunk(index: u64, fragment: &str) -> Value {
        json!({"choices": [{"delta": {"tool_calls": [
            {"index": index, "function": {"arguments": fragment}}
        ]}}]})
    }

    #[test]
    fn test_content_appends() {
        let acc = feed(&[json!({"content": "Hel"}), json!({"content": "lo"})]);
        assert_eq!(acc.content, "Hello");
        assert_eq!(acc.chunks, 2);
    }

    #[test]
    fn test_openai_delta_shape_and_reasoning() {
        let acc = feed(&[
            json!({"choices": [{"delta": {"reasoning_content": "think "}}]}),
            json!({"choices": [{"delta": {"reasoning_content": "more"}}]}),
        ]);
        assert_eq!(acc.content, "");
        assert_eq!(acc.reasoning, "think more");
        assert_eq!(Aggregated::from(&acc).final_text(), "think more");
    }

    #[test]
    fn test_fragments_append_then_resolve() {
        let acc = feed(&[args_chunk(0, "{\"a\":1"), args_chunk(0, "}")]);
        let tool = &acc.tools[&0];
        assert_eq!(tool.raw_arguments, "{\"a\":1}");
        assert_eq!(Value::Object(tool.arguments()), json!({"a": 1}));
    }

    #[test]
    fn test_standalone_object_replaces_partial_buffer() {
        let acc = feed(&[args_chunk(0, "{\"a\":"), args_chunk(0, "{\"a\":1}")]);
        let tool = &acc.tools[&0];
        assert_eq!(tool.raw_arguments, "{\"a\":1}");
        assert_eq!(Value::Object(tool.arguments()), json!({"a": 1}));
    }

    #[test]
    fn test_resolution_is_monotonic() {
        let acc = feed(&[args_chunk(0, "{\"a\":1}"), args_chunk(0, ",\"b\"")]);
        let tool = &acc.tools[&0];
        assert_eq!(tool.raw_arguments, "{\"a\":1},\"b\"");
        assert_eq!(Value::Object(tool.arguments()), json!({"a": 1}));
    }

    #[test]
    fn test_tool_identity_by_index() {
        let acc = feed(&[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "search", "arguments": ""}},
                {"index": 1, "id": "call_b", "function": {"name": "ocr", "arguments": "{}"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "", "function": {"name": "", "arguments": "{\"q\":\"x\"}"}}
            ]}}]}),
        ]);
        let agg = Aggregated::from(&acc);
        assert_eq!(agg.tool_calls.len(), 2);
        assert_eq!(agg.tool_calls[0].id.as_deref(), Some("call_a"));
        assert_eq!(agg.tool_calls[0].name, "search");
        assert_eq!(Value::Object(agg.tool_calls[0].arguments.clone()), json!({"q": "x"}));
        assert_eq!(agg.tool_calls[1].name, "ocr");
    }

    #[test]
    fn test_unparseable_chunk_is_counted_but_ignored() {
        let acc = fold(Accumulator::default(), "not json");
        assert_eq!(acc.chunks, 1);
        assert!(acc.content.is_empty());
    }
}
