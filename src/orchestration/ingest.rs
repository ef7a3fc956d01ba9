//! Client tool result normalisation and ingestion

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::ledger::{sha256_hex, to_canonical_json};
use crate::model::{parse_arguments, ToolResult};
use crate::store::StepContextStore;

use super::memory::{MemoryMessage, MemoryStore};
use super::types::new_call_id;

/// Name used when a client result does not say which tool produced it.
pub const UNKNOWN_CLIENT_TOOL: &str = "client_tool";

/// Client result folded into [`ToolResult`] shape.
///
/// Accepts `callId`/`tool_call_id`/`id`, `name`/`function.name` and any of
/// `data`, `payload` or `content` as the body. A case-insensitive
/// `status: "ERROR"` marks a failure.
pub fn normalize_client_result(item: &Value) -> ToolResult {
    let call_id = ["callId", "tool_call_id", "id"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_str))
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_call_id);
    let name = item
        .get("name")
        .or_else(|| item.pointer("/function/name"))
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(UNKNOWN_CLIENT_TOOL)
        .to_string();
    let data = ["data", "payload", "content"]
        .iter()
        .find_map(|k| item.get(*k))
        .cloned()
        .unwrap_or(Value::Null);

    let failed = item
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.eq_ignore_ascii_case("error"))
        .unwrap_or(false);
    if failed {
        let message = item
            .get("message")
            .or_else(|| data.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("client tool failed")
            .to_string();
        ToolResult::error(call_id, name, message)
    } else {
        ToolResult::success(call_id, name, data)
    }
}

/// Hash of a client result batch, stable under key order.
pub fn batch_hash(items: &[Value]) -> String {
    sha256_hex(&to_canonical_json(&Value::Array(items.to_vec())))
}

/// Text stored as the content of a tool message.
pub fn tool_message_content(data: &Value) -> String {
    match data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Write client results into memory as tool drafts, once per call id.
///
/// Returns the results newly ingested by this call.
pub async fn ingest_client_results(
    store: &StepContextStore,
    memory: &dyn MemoryStore,
    step_id: &str,
    user_id: &str,
    conversation_id: &str,
    items: &[Value],
) -> Vec<ToolResult> {
    let mut ingested = Vec::new();
    for item in items {
        let result = normalize_client_result(item);
        if store.is_client_result_ingested(step_id, &result.call_id) {
            debug!(step_id, call_id = %result.call_id, "client result already ingested");
            continue;
        }
        let seq = match memory.find_max_seq(user_id, conversation_id, step_id).await {
            Ok(max) => max.unwrap_or(0) + 1,
            Err(e) => {
                warn!(step_id, error = %e, "memory lookup failed");
                continue;
            }
        };
        let arguments = parse_arguments(item.get("arguments"));
        let message = MemoryMessage::draft(
            user_id,
            conversation_id,
            step_id,
            seq,
            "tool",
            tool_message_content(&result.data),
        )
        .with_payload(json!({
            "source": "client",
            "tool_call_id": result.call_id,
            "name": result.name,
            "status": result.status,
            "arguments": arguments,
        }));
        if let Err(e) = memory.upsert_message(message).await {
            warn!(step_id, call_id = %result.call_id, error = %e, "client result not persisted");
            continue;
        }
        store.mark_client_result_ingested(step_id, &result.call_id);
        ingested.push(result);
    }
    store.save_tool_results(step_id, &ingested);
    ingested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::memory::InMemoryMemoryStore;

    #[test]
    fn test_normalize_aliases() {
        let result = normalize_client_result(&json!({
            "tool_call_id": "c1",
            "function": {"name": "pick_point"},
            "payload": {"x": 1}
        }));
        assert_eq!(result.call_id, "c1");
        assert_eq!(result.name, "pick_point");
        assert_eq!(result.data, json!({"x": 1}));
        assert!(result.is_success());
    }

    #[test]
    fn test_normalize_defaults_and_errors() {
        let result = normalize_client_result(&json!({"status": "error", "message": "denied"}));
        assert!(result.call_id.starts_with("call_"));
        assert_eq!(result.name, UNKNOWN_CLIENT_TOOL);
        assert_eq!(result.error_message(), Some("denied"));
    }

    #[test]
    fn test_batch_hash_ignores_key_order() {
        let a = batch_hash(&[json!({"callId": "1", "data": 2})]);
        let b = batch_hash(&[json!({"data": 2, "callId": "1"})]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_ingest_once_per_call_id() {
        let store = StepContextStore::new();
        let memory = InMemoryMemoryStore::new();
        let items = vec![json!({"callId": "c1", "name": "pick_point", "data": {"x": 1}})];

        let first = ingest_client_results(&store, &memory, "s1", "u", "c", &items).await;
        let second = ingest_client_results(&store, &memory, "s1", "u", "c", &items).await;

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(store.is_client_result_ingested("s1", "c1"));
        let stored = memory.step_messages("s1").await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].role, "tool");
        assert_eq!(stored[0].seq, 1);
        assert_eq!(stored[0].content, "{\"x\":1}");
    }
}
