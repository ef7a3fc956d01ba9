//! Ephemeral per-step bookkeeping.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::model::{ToolCall, ToolResult};

/// Which user and conversation own a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBinding {
    pub user_id: String,
    pub conversation_id: String,
}

impl StepBinding {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// `userId:conversationId`, the audit scope of the step.
    pub fn scope(&self) -> String {
        format!("{}:{}", self.user_id, self.conversation_id)
    }
}

/// Loop state parked while a step waits for client results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendedStep {
    pub loop_count: u32,
    pub executed_keys: BTreeSet<String>,
    pub context_hash: Option<String>,
}

#[derive(Debug)]
struct StepEntry {
    binding: Option<StepBinding>,
    planned: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
    deferred_client: Vec<ToolCall>,
    dispatched_client: Option<Vec<ToolCall>>,
    ingested_call_ids: HashSet<String>,
    user_input_persisted: bool,
    client_batches: HashSet<String>,
    suspended: Option<SuspendedStep>,
    touched_at: Instant,
}

impl Default for StepEntry {
    fn default() -> Self {
        Self {
            binding: None,
            planned: Vec::new(),
            tool_results: Vec::new(),
            deferred_client: Vec::new(),
            dispatched_client: None,
            ingested_call_ids: HashSet::new(),
            user_input_persisted: false,
            client_batches: HashSet::new(),
            suspended: None,
            touched_at: Instant::now(),
        }
    }
}

/// Merge `incoming` into `base` by call id, keeping first-seen order.
fn merge_by_id(base: &mut Vec<ToolCall>, incoming: &[ToolCall]) {
    for call in incoming {
        if !base.iter().any(|c| c.id == call.id) {
            base.push(call.clone());
        }
    }
}

/// Keyed store of step bookkeeping. Every operation touches one step key.
#[derive(Debug, Default)]
pub struct StepContextStore {
    steps: DashMap<String, StepEntry>,
}

impl StepContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<R>(&self, step_id: &str, f: impl FnOnce(&mut StepEntry) -> R) -> R {
        let mut entry = self.steps.entry(step_id.to_string()).or_default();
        entry.touched_at = Instant::now();
        f(&mut entry)
    }

    // === Binding ===

    pub fn bind(&self, step_id: &str, user_id: &str, conversation_id: &str) {
        self.with_entry(step_id, |e| {
            e.binding = Some(StepBinding::new(user_id, conversation_id));
        });
    }

    pub fn get(&self, step_id: &str) -> Option<StepBinding> {
        self.steps.get(step_id).and_then(|e| e.binding.clone())
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.contains_key(step_id)
    }

    // === Planned calls and server results ===

    pub fn save_planned_calls(&self, step_id: &str, calls: &[ToolCall]) {
        if calls.is_empty() {
            return;
        }
        self.with_entry(step_id, |e| e.planned = calls.to_vec());
    }

    pub fn drain_planned_calls(&self, step_id: &str) -> Vec<ToolCall> {
        self.steps
            .get_mut(step_id)
            .map(|mut e| std::mem::take(&mut e.planned))
            .unwrap_or_default()
    }

    pub fn save_tool_results(&self, step_id: &str, results: &[ToolResult]) {
        if results.is_empty() {
            return;
        }
        self.with_entry(step_id, |e| e.tool_results = results.to_vec());
    }

    pub fn drain_tool_results(&self, step_id: &str) -> Vec<ToolResult> {
        self.steps
            .get_mut(step_id)
            .map(|mut e| std::mem::take(&mut e.tool_results))
            .unwrap_or_default()
    }

    // === Client calls: deferred -> dispatched -> ingested ===

    /// Stash client calls, merged with earlier ones by id in stable order.
    pub fn save_client_calls(&self, step_id: &str, calls: &[ToolCall]) {
        if calls.is_empty() {
            return;
        }
        self.with_entry(step_id, |e| merge_by_id(&mut e.deferred_client, calls));
    }

    /// Take the deferred client calls and mark them dispatched.
    pub fn poll_client_calls(&self, step_id: &str) -> Vec<ToolCall> {
        let Some(mut e) = self.steps.get_mut(step_id) else {
            return Vec::new();
        };
        let planned = std::mem::take(&mut e.deferred_client);
        if !planned.is_empty() {
            merge_by_id(e.dispatched_client.get_or_insert_with(Vec::new), &planned);
        }
        planned
    }

    pub fn mark_client_result_ingested(&self, step_id: &str, call_id: &str) {
        if call_id.trim().is_empty() {
            return;
        }
        self.with_entry(step_id, |e| {
            e.ingested_call_ids.insert(call_id.to_string());
        });
    }

    pub fn is_client_result_ingested(&self, step_id: &str, call_id: &str) -> bool {
        self.steps
            .get(step_id)
            .map(|e| e.ingested_call_ids.contains(call_id))
            .unwrap_or(false)
    }

    /// Client calls without an ingested result: the dispatched set when one
    /// exists, otherwise the deferred set.
    pub fn unsatisfied_client_calls(&self, step_id: &str) -> Vec<ToolCall> {
        self.steps
            .get(step_id)
            .map(|e| {
                let base = e.dispatched_client.as_ref().unwrap_or(&e.deferred_client);
                base.iter()
                    .filter(|c| !e.ingested_call_ids.contains(&c.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read-only view: dispatched calls if any were dispatched, else deferred.
    pub fn list_client_calls(&self, step_id: &str) -> Vec<ToolCall> {
        self.steps
            .get(step_id)
            .map(|e| {
                e.dispatched_client
                    .clone()
                    .unwrap_or_else(|| e.deferred_client.clone())
            })
            .unwrap_or_default()
    }

    // === Once-markers ===

    /// True the first time it is called for a step.
    pub fn mark_user_input_once(&self, step_id: &str) -> bool {
        self.with_entry(step_id, |e| !std::mem::replace(&mut e.user_input_persisted, true))
    }

    /// True the first time a given client result batch hash is seen.
    pub fn mark_client_batch_once(&self, step_id: &str, batch_hash: &str) -> bool {
        self.with_entry(step_id, |e| e.client_batches.insert(batch_hash.to_string()))
    }

    // === Suspension across WAIT_CLIENT ===

    pub fn suspend(&self, step_id: &str, state: SuspendedStep) {
        self.with_entry(step_id, |e| e.suspended = Some(state));
    }

    pub fn take_suspended(&self, step_id: &str) -> Option<SuspendedStep> {
        self.steps
            .get_mut(step_id)
            .and_then(|mut e| e.suspended.take())
    }

    // === Cleanup ===

    pub fn clear(&self, step_id: &str) {
        self.steps.remove(step_id);
    }

    pub fn clear_by_user_conv(&self, user_id: &str, conversation_id: &str) -> usize {
        let before = self.steps.len();
        self.steps.retain(|_, e| {
            !matches!(
                &e.binding,
                Some(b) if b.user_id == user_id && b.conversation_id == conversation_id
            )
        });
        before.saturating_sub(self.steps.len())
    }

    pub fn clear_all(&self) {
        self.steps.clear();
    }

    /// Drop steps untouched for longer than `max_idle`, returning their ids.
    pub fn purge_idle(&self, max_idle: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .steps
            .iter()
            .filter(|e| now.saturating_duration_since(e.touched_at) > max_idle)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.steps
                .remove_if(id, |_, e| now.saturating_duration_since(e.touched_at) > max_idle);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::client(id, "pick_point", json!({}))
    }

    #[test]
    fn test_bind_and_get() {
        let store = StepContextStore::new();
        assert!(store.get("s1").is_none());
        store.bind("s1", "u1", "c1");
        assert_eq!(store.get("s1"), Some(StepBinding::new("u1", "c1")));
        assert_eq!(store.get("s1").unwrap().scope(), "u1:c1");
    }

    #[test]
    fn test_drain_is_take() {
        let store = StepContextStore::new();
        store.save_planned_calls("s1", &[ToolCall::server("a", "search", json!({}))]);
        assert_eq!(store.drain_planned_calls("s1").len(), 1);
        assert!(store.drain_planned_calls("s1").is_empty());

        store.save_tool_results("s1", &[ToolResult::success("a", "search", json!(1))]);
        assert_eq!(store.drain_tool_results("s1").len(), 1);
        assert!(store.drain_tool_results("s1").is_empty());
        assert!(store.drain_tool_results("missing").is_empty());
    }

    #[test]
    fn test_client_calls_merge_and_dispatch() {
        let store = StepContextStore::new();
        store.save_client_calls("s1", &[call("a"), call("b")]);
        store.save_client_calls("s1", &[call("b"), call("c")]);
        let ids: Vec<_> = store.list_client_calls("s1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let polled = store.poll_client_calls("s1");
        assert_eq!(polled.len(), 3);
        assert!(store.poll_client_calls("s1").is_empty());
        assert_eq!(store.list_client_calls("s1").len(), 3);

        store.mark_client_result_ingested("s1", "b");
        let open: Vec<_> = store
            .unsatisfied_client_calls("s1")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(open, vec!["a", "c"]);
    }

    #[test]
    fn test_unsatisfied_falls_back_to_deferred() {
        let store = StepContextStore::new();
        store.save_client_calls("s1", &[call("a")]);
        assert_eq!(store.unsatisfied_client_calls("s1").len(), 1);
    }

    #[test]
    fn test_once_markers() {
        let store = StepContextStore::new();
        assert!(store.mark_user_input_once("s1"));
        assert!(!store.mark_user_input_once("s1"));
        assert!(store.mark_client_batch_once("s1", "h1"));
        assert!(!store.mark_client_batch_once("s1", "h1"));
        assert!(store.mark_client_batch_once("s1", "h2"));
    }

    #[test]
    fn test_suspend_round_trip() {
        let store = StepContextStore::new();
        let mut state = SuspendedStep::default();
        state.loop_count = 3;
        state.executed_keys.insert("search::{}".to_string());
        store.suspend("s1", state.clone());
        assert_eq!(store.take_suspended("s1"), Some(state));
        assert!(store.take_suspended("s1").is_none());
    }

    #[test]
    fn test_clear_variants() {
        let store = StepContextStore::new();
        store.bind("s1", "u1", "c1");
        store.bind("s2", "u1", "c1");
        store.bind("s3", "u2", "c9");
        assert_eq!(store.clear_by_user_conv("u1", "c1"), 2);
        assert!(store.contains("s3"));
        store.clear("s3");
        assert!(store.is_empty());

        store.bind("s4", "u", "c");
        store.clear_all();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle() {
        let store = StepContextStore::new();
        store.bind("s1", "u", "c");
        store.bind("s2", "u", "c");
        assert!(store.purge_idle(Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(45)).await;
        store.bind("s2", "u", "c");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.purge_idle(Duration::from_secs(60)), vec!["s1".to_string()]);
        assert!(store.contains("s2"));
    }
}
