//! Step request, step state and model decision types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

use crate::model::{parse_arguments, ExecTarget, ToolCall};
use crate::stream::Aggregated;

use super::errors::{OrchestratorError, OrchestratorResult};

/// Inbound request for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepRequest {
    pub user_id: String,
    pub conversation_id: String,
    /// User text, may be empty on resume
    pub q: Option<String>,
    /// Step to resume (the step that returned WAIT_CLIENT)
    pub resume_step_id: Option<String>,
    /// Model override
    pub model: Option<String>,
    /// `"auto"` or `"none"`
    pub tool_choice: Option<String>,
    /// Server tool calls supplied by the caller, executed before any decision
    #[serde(alias = "tool_calls")]
    pub tool_calls: Option<Value>,
    /// Tool schemas executed by the remote client
    pub client_tools: Vec<Value>,
    /// Results of previously dispatched client calls
    #[serde(alias = "client_results")]
    pub client_results: Vec<Value>,
}

impl StepRequest {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, q: impl Into<String>) -> Self {
        self.q = Some(q.into());
        self
    }

    pub fn resuming(mut self, step_id: impl Into<String>) -> Self {
        self.resume_step_id = Some(step_id.into());
        self
    }

    pub fn with_client_tools(mut self, tools: Vec<Value>) -> Self {
        self.client_tools = tools;
        self
    }

    pub fn with_client_results(mut self, results: Vec<Value>) -> Self {
        self.client_results = results;
        self
    }

    /// Non-blank user text.
    pub fn query(&self) -> Option<&str> {
        self.q.as_deref().filter(|q| !q.trim().is_empty())
    }

    /// Names of the client tools declared by this request.
    ///
    /// Accepts both `{"name": ..}` and `{"function": {"name": ..}}` shapes.
    pub fn client_tool_names(&self) -> HashSet<String> {
        self.client_tools
            .iter()
            .filter_map(|tool| {
                tool.get("function")
                    .and_then(|f| f.get("name"))
                    .or_else(|| tool.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect()
    }

    /// Caller-supplied server calls, normalised from OpenAI or flat shapes.
    pub fn initial_tool_calls(&self) -> Vec<ToolCall> {
        match &self.tool_calls {
            Some(Value::Array(items)) => items.iter().filter_map(tool_call_from_value).collect(),
            Some(item @ Value::Object(_)) => tool_call_from_value(item).into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn tool_call_from_value(item: &Value) -> Option<ToolCall> {
    let function = item.get("function");
    let name = function
        .and_then(|f| f.get("name"))
        .or_else(|| item.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())?;
    let arguments = parse_arguments(
        function
            .and_then(|f| f.get("arguments"))
            .or_else(|| item.get("arguments")),
    );
    let id = item
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_call_id);
    Some(ToolCall::new(id, name, arguments, ExecTarget::Server))
}

/// Fresh `call_<12 hex>` id.
pub fn new_call_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &simple[..12])
}

/// Terminal state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishState {
    Running,
    Done,
    WaitClient,
}

/// Immutable loop state. Transitions return a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub step_id: String,
    pub loop_count: u32,
    pub finish: FinishState,
    /// Server calls waiting to execute in the next iteration
    pub pending: Vec<ToolCall>,
    /// `name::stableArgs` of every server call executed in this step
    pub executed_keys: BTreeSet<String>,
    pub context_hash: Option<String>,
}

impl Step {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            loop_count: 0,
            finish: FinishState::Running,
            pending: Vec::new(),
            executed_keys: BTreeSet::new(),
            context_hash: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.finish == FinishState::Running
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn with_pending(mut self, pending: Vec<ToolCall>) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_context_hash(mut self, hash: impl Into<String>) -> Self {
        self.context_hash = Some(hash.into());
        self
    }

    pub fn with_executed<I: IntoIterator<Item = String>>(mut self, keys: I) -> Self {
        self.executed_keys.extend(keys);
        self
    }

    /// Advance to the next loop with pending cleared.
    pub fn next_loop(mut self) -> Self {
        self.loop_count += 1;
        self.pending.clear();
        self
    }

    /// Finish with a final answer. Refused while server calls are pending.
    pub fn done(mut self) -> OrchestratorResult<Self> {
        if self.has_pending() {
            return Err(OrchestratorError::transition(format!(
                "step {} has {} pending server call(s)",
                self.step_id,
                self.pending.len()
            )));
        }
        self.finish = FinishState::Done;
        Ok(self)
    }

    /// Park the step until the client supplies results for `outstanding`.
    pub fn wait_client(mut self, outstanding: &[ToolCall]) -> OrchestratorResult<Self> {
        if outstanding.is_empty() {
            return Err(OrchestratorError::transition(format!(
                "step {} cannot wait without outstanding client calls",
                self.step_id
            )));
        }
        self.pending.clear();
        self.finish = FinishState::WaitClient;
        Ok(self)
    }

    /// Drop pending calls on the forced max-loop exit.
    pub fn abandon_pending(mut self) -> Self {
        self.pending.clear();
        self
    }
}

/// Outcome of one model decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub tool_calls: Vec<ToolCall>,
    /// Non-blank assistant text proposed alongside (or instead of) calls
    pub draft: Option<String>,
}

impl Decision {
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty() && self.draft.is_none()
    }

    /// Decode a non-streaming completion shaped like `choices[0].message`.
    ///
    /// A bare message object and the `_provider_assistant` fallback are
    /// accepted too. Anything unreadable yields an empty decision.
    pub fn from_completion(completion: &Value, client_tools: &HashSet<String>) -> Self {
        let message = completion
            .pointer("/choices/0/message")
            .or_else(|| completion.get("_provider_assistant"))
            .or_else(|| completion.get("message"))
            .unwrap_or(completion);

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let mut parsed = tool_call_from_value(call)?;
                        parsed.exec_target = target_for(&parsed.name, client_tools);
                        Some(parsed)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            tool_calls,
            draft: message
                .get("content")
                .and_then(Value::as_str)
                .and_then(non_blank),
        }
    }

    /// Decision out of a streamed aggregation. Nameless calls are skipped.
    pub fn from_aggregated(aggregated: &Aggregated, client_tools: &HashSet<String>) -> Self {
        let tool_calls = aggregated
            .tool_calls
            .iter()
            .filter(|call| !call.name.trim().is_empty())
            .map(|call| {
                let id = call
                    .id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(new_call_id);
                ToolCall::new(
                    id,
                    call.name.clone(),
                    call.arguments.clone(),
                    target_for(&call.name, client_tools),
                )
            })
            .collect();
        Self {
            tool_calls,
            draft: non_blank(&aggregated.content),
        }
    }

    /// Split calls into (server, client) keeping decision order.
    pub fn partition(&self) -> (Vec<ToolCall>, Vec<ToolCall>) {
        self.tool_calls.iter().cloned().partition(|c| !c.is_client())
    }
}

fn target_for(name: &str, client_tools: &HashSet<String>) -> ExecTarget {
    if client_tools.contains(name) {
        ExecTarget::Client
    } else {
        ExecTarget::Server
    }
}

fn non_blank(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_names() -> HashSet<String> {
        ["pick_point".to_string()].into_iter().collect()
    }

    #[test]
    fn test_request_accepts_snake_case_aliases() {
        let request: StepRequest = serde_json::from_value(json!({
            "userId": "u1",
            "conversationId": "c1",
            "q": "hi",
            "tool_calls": [{"id": "t1", "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}}],
            "clientTools": [{"type": "function", "function": {"name": "pick_point"}}]
        }))
        .unwrap();
        let calls = request.initial_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].arguments_value(), json!({"q": "x"}));
        assert_eq!(request.client_tool_names(), client_names());
        assert_eq!(request.query(), Some("hi"));
    }

    #[test]
    fn test_generated_call_ids() {
        let request = StepRequest {
            tool_calls: Some(json!({"name": "search", "arguments": {"q": 1}})),
            ..Default::default()
        };
        let calls = request.initial_tool_calls();
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].id.len(), "call_".len() + 12);
    }

    #[test]
    fn test_step_transitions() {
        let step = Step::new("s1").with_pending(vec![ToolCall::server("a", "search", json!({}))]);
        assert!(step.clone().done().is_err());
        assert!(step.clone().wait_client(&[]).is_err());

        let next = step.next_loop();
        assert_eq!(next.loop_count, 1);
        assert!(!next.has_pending());
        assert_eq!(next.done().unwrap().finish, FinishState::Done);
    }

    #[test]
    fn test_wait_client_requires_outstanding_call() {
        let outstanding = vec![ToolCall::client("c", "pick_point", json!({}))];
        let step = Step::new("s1").wait_client(&outstanding).unwrap();
        assert_eq!(step.finish, FinishState::WaitClient);
    }

    #[test]
    fn test_decision_from_completion() {
        let completion = json!({
            "choices": [{"message": {
                "content": "  ",
                "tool_calls": [
                    {"id": "a", "type": "function", "function": {"name": "search", "arguments": "{\"q\":1}"}},
                    {"id": "b", "type": "function", "function": {"name": "pick_point", "arguments": "{bad"}}
                ]
            }}]
        });
        let decision = Decision::from_completion(&completion, &client_names());
        assert!(decision.draft.is_none());
        let (server, client) = decision.partition();
        assert_eq!(server[0].name, "search");
        assert_eq!(client[0].id, "b");
        assert!(client[0].arguments.is_empty());
    }

    #[test]
    fn test_decision_from_malformed_completion_is_empty() {
        assert!(Decision::from_completion(&json!("oops"), &HashSet::new()).is_empty());
        let fallback = json!({"_provider_assistant": {"content": "hello"}});
        assert_eq!(
            Decision::from_completion(&fallback, &HashSet::new()).draft.as_deref(),
            Some("hello")
        );
    }
}
