//! Rebuild step events from conversation memory

use serde_json::Value;
use std::collections::HashSet;

use crate::model::{parse_arguments, ExecTarget, ToolCall, ToolResult, ToolStatus};

use super::errors::{OrchestratorError, OrchestratorResult};
use super::events::{FinishReason, StepEvent, StepEventBody};
use super::memory::{MemoryMessage, MemoryStore};

/// Replay the last `limit` messages of a conversation as one
/// `started` .. `finished` sequence.
///
/// With `up_to_step`, messages after that step's last message are left out.
/// A step that is not in the window replays nothing between the two
/// envelope events.
pub async fn replay(
    memory: &dyn MemoryStore,
    user_id: &str,
    conversation_id: &str,
    up_to_step: Option<&str>,
    limit: usize,
) -> OrchestratorResult<Vec<StepEvent>> {
    let mut messages = memory
        .recent(user_id, conversation_id, limit)
        .await
        .map_err(|e| OrchestratorError::memory(e.to_string()))?;
    if let Some(step_id) = up_to_step.filter(|s| !s.trim().is_empty()) {
        let keep = messages
            .iter()
            .rposition(|m| m.step_id == step_id)
            .map(|last| last + 1)
            .unwrap_or(0);
        messages.truncate(keep);
    }
    let replay_id = format!("replay-{}", uuid::Uuid::new_v4());
    Ok(replay_messages(&replay_id, &messages))
}

/// Map stored messages, oldest first, to events. The envelope events carry
/// `replay_id`; every other event carries its message's step id.
///
/// Consecutive tool rows of one step become a single `tools` event.
pub fn replay_messages(replay_id: &str, messages: &[MemoryMessage]) -> Vec<StepEvent> {
    let client_call_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == "tool" && payload_str(m, "source") == Some("client"))
        .filter_map(|m| payload_str(m, "tool_call_id"))
        .collect();

    let mut events = vec![StepEvent::new(StepEventBody::Started {
        step_id: replay_id.to_string(),
        loop_count: 0,
    })];
    let mut batch: Vec<ToolResult> = Vec::new();
    let mut batch_step = String::new();

    for message in messages {
        if message.role == "tool" {
            if batch_step != message.step_id {
                flush_batch(&mut events, &batch_step, &mut batch);
                batch_step = message.step_id.clone();
            }
            batch.push(tool_result(message));
            continue;
        }
        flush_batch(&mut events, &batch_step, &mut batch);

        let step_id = message.step_id.clone();
        let body = match message.role.as_str() {
            "assistant" if payload_str(message, "type") == Some("assistant_decision") => {
                StepEventBody::Decision {
                    step_id,
                    tool_calls: decision_calls(message, &client_call_ids),
                }
            }
            _ if message.content.trim().is_empty() => continue,
            "assistant" => StepEventBody::Assistant {
                step_id,
                text: message.content.clone(),
            },
            "user" => StepEventBody::Message {
                step_id,
                role: message.role.clone(),
                text: message.content.clone(),
            },
            _ => continue,
        };
        events.push(StepEvent::new(body));
    }
    flush_batch(&mut events, &batch_step, &mut batch);

    events.push(StepEvent::new(StepEventBody::Finished {
        step_id: replay_id.to_string(),
        loop_count: 0,
        reason: FinishReason::Done,
    }));
    events
}

fn flush_batch(events: &mut Vec<StepEvent>, step_id: &str, batch: &mut Vec<ToolResult>) {
    if batch.is_empty() {
        return;
    }
    events.push(StepEvent::new(StepEventBody::Tools {
        step_id: step_id.to_string(),
        results: std::mem::take(batch),
    }));
}

fn payload_str<'a>(message: &'a MemoryMessage, key: &str) -> Option<&'a str> {
    message.payload.as_ref()?.get(key)?.as_str()
}

/// Calls from an `assistant_decision` payload, stored in OpenAI form.
fn decision_calls(message: &MemoryMessage, client_call_ids: &HashSet<&str>) -> Vec<ToolCall> {
    let items = message
        .payload
        .as_ref()
        .and_then(|p| p.get("tool_calls"))
        .and_then(Value::as_array);
    items
        .into_iter()
        .flatten()
        .filter_map(|item| {
            let id = item.get("id")?.as_str()?;
            let function = item.get("function")?;
            let name = function.get("name")?.as_str()?;
            let target = if client_call_ids.contains(id) {
                ExecTarget::Client
            } else {
                ExecTarget::Server
            };
            Some(ToolCall::new(
                id,
                name,
                parse_arguments(function.get("arguments")),
                target,
            ))
        })
        .collect()
}

fn tool_result(message: &MemoryMessage) -> ToolResult {
    let payload = message.payload.as_ref();
    let status = payload
        .and_then(|p| p.get("status"))
        .and_then(|s| serde_json::from_value::<ToolStatus>(s.clone()).ok())
        .unwrap_or(ToolStatus::Success);
    // tool content is the JSON text of the result data, or the bare string
    let data = serde_json::from_str::<Value>(&message.content)
        .unwrap_or_else(|_| Value::String(message.content.clone()));
    ToolResult {
        call_id: payload_str(message, "tool_call_id")
            .unwrap_or_default()
            .to_string(),
        name: payload_str(message, "name").unwrap_or_default().to_string(),
        reused: payload
            .and_then(|p| p.get("reused"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        status,
        data,
        executed_key: None,
    }
}
