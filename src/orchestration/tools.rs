//! Server tool execution: ledger-backed, bounded and ordered

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ledger::{ExecuteOptions, IdempotencyLedger, LedgerKey};
use crate::model::{ToolCall, ToolResult};

/// Message of the error result produced for a disabled tool.
pub const DISABLED_MESSAGE: &str = "DISABLED: tool disabled by runtime config";

/// Argument keys read as per-call ledger controls and never fingerprinted.
const FORCE_ARG: &str = "force";
const TTL_ARG: &str = "ttlSeconds";

/// Executes server tools for the orchestrator.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one call. Returning an error-status result or an `Err` both
    /// count as a failed execution; neither is stored for reuse.
    async fn execute(
        &self,
        call: &ToolCall,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<ToolResult>;

    /// Schemas offered to the model (OpenAI `tools[]` items).
    fn schemas(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// Identity of the step a batch runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolScope {
    pub user_id: String,
    pub conversation_id: String,
    pub context_hash: String,
}

impl ToolScope {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        context_hash: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            context_hash: context_hash.into(),
        }
    }

    /// Audit chain scope.
    pub fn audit_scope(&self) -> String {
        format!("{}:{}", self.user_id, self.conversation_id)
    }
}

/// A call ready for the ledger: scope ids injected, control keys removed.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub call: ToolCall,
    pub executed_key: String,
    pub fingerprint: String,
    pub options: ExecuteOptions,
}

/// Runs batches of server calls through the idempotency ledger.
#[derive(Clone)]
pub struct ToolPipeline {
    executor: Arc<dyn ToolExecutor>,
    ledger: Arc<IdempotencyLedger>,
    concurrency: usize,
    timeout: Duration,
    disabled: Arc<HashSet<String>>,
}

impl ToolPipeline {
    pub fn new(executor: Arc<dyn ToolExecutor>, ledger: Arc<IdempotencyLedger>) -> Self {
        Self {
            executor,
            ledger,
            concurrency: 4,
            timeout: Duration::from_secs(300),
            disabled: Arc::new(HashSet::new()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_disabled<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disabled = Arc::new(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.executor.schemas()
    }

    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    /// Inject scope ids, strip ledger controls and compute identities.
    pub fn prepare(&self, call: &ToolCall, scope: &ToolScope) -> PreparedCall {
        let mut arguments = call.arguments.clone();
        inject_if_absent(&mut arguments, "userId", &scope.user_id);
        inject_if_absent(&mut arguments, "conversationId", &scope.conversation_id);

        let force = arguments
            .remove(FORCE_ARG)
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let ttl = arguments
            .remove(TTL_ARG)
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);

        let args = Value::Object(arguments.clone());
        let fingerprinter = self.ledger.fingerprinter();
        PreparedCall {
            executed_key: fingerprinter.executed_key(&call.name, &args),
            fingerprint: fingerprinter.fingerprint(&call.name, &args, &scope.context_hash),
            call: ToolCall::new(call.id.clone(), call.name.clone(), arguments, call.exec_target),
            options: ExecuteOptions { force, ttl },
        }
    }

    /// Execute `calls` and return results in input order.
    ///
    /// At most `concurrency` calls run at once. Each call is spawned, so a
    /// dispatched execution runs to completion even if the caller stops
    /// waiting for the batch.
    pub async fn execute_batch(&self, calls: Vec<ToolCall>, scope: &ToolScope) -> Vec<ToolResult> {
        let tasks = calls.into_iter().map(|call| {
            let pipeline = self.clone();
            let scope = scope.clone();
            let fallback = (call.id.clone(), call.name.clone());
            async move {
                match tokio::spawn(async move { pipeline.execute_one(call, &scope).await }).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(tool = %fallback.1, error = %e, "tool task aborted");
                        ToolResult::error(
                            fallback.0,
                            fallback.1,
                            format!("tool task aborted: {}", e),
                        )
                    }
                }
            }
        });
        stream::iter(tasks)
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Execute one call under the per-tool timeout. Never fails.
    pub async fn execute_one(&self, call: ToolCall, scope: &ToolScope) -> ToolResult {
        if self.disabled.contains(&call.name) {
            debug!(tool = %call.name, "tool disabled");
            return ToolResult::error(call.id, call.name, DISABLED_MESSAGE);
        }

        let prepared = self.prepare(&call, scope);
        let key = LedgerKey::new(
            scope.audit_scope(),
            prepared.call.name.clone(),
            prepared.fingerprint.clone(),
        );
        let args = prepared.call.arguments_value();
        let executor = self.executor.clone();
        let run_call = prepared.call.clone();
        let user_id = scope.user_id.clone();
        let conversation_id = scope.conversation_id.clone();

        let execution = self.ledger.execute_once(&key, &args, prepared.options, move || async move {
            match executor.execute(&run_call, &user_id, &conversation_id).await {
                Ok(result) if result.is_success() => Ok(result.data),
                Ok(result) => Err(result
                    .error_message()
                    .unwrap_or("tool reported an error")
                    .to_string()),
                Err(e) => Err(e.to_string()),
            }
        });

        match tokio::time::timeout(self.timeout, execution).await {
            Ok(Ok(execution)) => ToolResult::success(call.id, call.name, execution.data)
                .with_reused(execution.reused)
                .with_executed_key(prepared.executed_key),
            Ok(Err(message)) => {
                warn!(tool = %call.name, error = %message, "tool failed");
                ToolResult::error(call.id, call.name, message)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_secs = self.timeout.as_secs(), "tool timed out");
                ToolResult::error(
                    call.id,
                    call.name,
                    format!("timeout after {}s", self.timeout.as_secs()),
                )
            }
        }
    }
}

fn inject_if_absent(arguments: &mut Map<String, Value>, key: &str, value: &str) {
    if !arguments.contains_key(key) && !value.is_empty() {
        arguments.insert(key.to_string(), Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ToolExecutor for Echo {
        async fn execute(&self, call: &ToolCall, _user: &str, _conv: &str) -> Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match call.name.as_str() {
                "fail" => Ok(ToolResult::error(&call.id, &call.name, "boom")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ToolResult::success(&call.id, &call.name, json!("late")))
                }
                _ => Ok(ToolResult::success(&call.id, &call.name, call.arguments_value())),
            }
        }
    }

    fn pipeline() -> (ToolPipeline, Arc<Echo>) {
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let pipeline = ToolPipeline::new(echo.clone(), Arc::new(IdempotencyLedger::default()))
            .with_timeout(Duration::from_secs(5));
        (pipeline, echo)
    }

    fn scope() -> ToolScope {
        ToolScope::new("u1", "c1", "ctx")
    }

    #[test]
    fn test_prepare_injects_and_strips_controls() {
        let (pipeline, _) = pipeline();
        let call = ToolCall::server(
            "a",
            "search",
            json!({"q": "x", "force": true, "ttlSeconds": 5}),
        );
        let prepared = pipeline.prepare(&call, &scope());
        assert_eq!(
            prepared.call.arguments_value(),
            json!({"q": "x", "userId": "u1", "conversationId": "c1"})
        );
        assert!(prepared.options.force);
        assert_eq!(prepared.options.ttl, Some(Duration::from_secs(5)));
        assert!(prepared.executed_key.starts_with("search::"));
    }

    #[test]
    fn test_prepare_keeps_caller_scope_ids() {
        let (pipeline, _) = pipeline();
        let call = ToolCall::server("a", "search", json!({"userId": "other"}));
        let prepared = pipeline.prepare(&call, &scope());
        assert_eq!(prepared.call.arguments["userId"], json!("other"));
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_isolates_failures() {
        let (pipeline, _) = pipeline();
        let calls = vec![
            ToolCall::server("1", "echo", json!({"n": 1})),
            ToolCall::server("2", "fail", json!({})),
            ToolCall::server("3", "echo", json!({"n": 3})),
        ];
        let results = pipeline.execute_batch(calls, &scope()).await;
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(results[0].is_success());
        assert_eq!(results[1].error_message(), Some("boom"));
        assert!(results[1].executed_key.is_none());
        assert!(results[2].is_success());
    }

    #[tokio::test]
    async fn test_reuse_across_batches() {
        let (pipeline, echo) = pipeline();
        let call = ToolCall::server("1", "echo", json!({"n": 1}));
        let first = pipeline.execute_one(call.clone(), &scope()).await;
        let second = pipeline.execute_one(call, &scope()).await;
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.data, second.data);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_result() {
        let (pipeline, _) = pipeline();
        let result = pipeline
            .execute_one(ToolCall::server("1", "slow", json!({})), &scope())
            .await;
        assert_eq!(result.error_message(), Some("timeout after 5s"));
    }

    #[tokio::test]
    async fn test_disabled_tool() {
        let (pipeline, echo) = pipeline();
        let pipeline = pipeline.with_disabled(["echo"]);
        let result = pipeline
            .execute_one(ToolCall::server("1", "echo", json!({})), &scope())
            .await;
        assert_eq!(result.error_message(), Some(DISABLED_MESSAGE));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }
}
