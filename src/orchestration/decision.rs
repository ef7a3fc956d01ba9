//! Model decisions and the final answer stream

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::EventHub;
use crate::provider::{ChatProvider, ChatRequest};
use crate::stream::StreamAggregator;

use super::errors::{OrchestratorError, OrchestratorResult};
use super::types::Decision;

/// Prefix of the final text when the answer stream failed before any text.
pub const STREAM_ERROR_PREFIX: &str = "[stream error]";

/// Aggregator id of a step's decision stream.
pub fn decision_stream_id(step_id: &str) -> String {
    format!("{}:decision", step_id)
}

/// Asks the model what to do next.
///
/// In streaming mode the decision is folded through the aggregator under
/// `<stepId>:decision` and nothing is forwarded to subscribers. Otherwise a
/// single completion is requested.
pub struct DecisionService {
    provider: Arc<dyn ChatProvider>,
    aggregator: Arc<StreamAggregator>,
    streaming: bool,
    idle: Duration,
}

impl DecisionService {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        aggregator: Arc<StreamAggregator>,
        streaming: bool,
        idle: Duration,
    ) -> Self {
        Self {
            provider,
            aggregator,
            streaming,
            idle,
        }
    }

    /// Request a decision. Unreadable model output resolves to an empty
    /// decision; only a failed non-streaming call is an error.
    pub async fn decide(
        &self,
        step_id: &str,
        request: ChatRequest,
        client_tools: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Decision> {
        if !self.streaming {
            let completion = tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                completion = self.provider.complete(&request) => completion,
            };
            let completion = completion.map_err(|e| OrchestratorError::provider(e.to_string()))?;
            return Ok(Decision::from_completion(&completion, client_tools));
        }

        let stream_id = decision_stream_id(step_id);
        // Nobody listens to decision chunks; the fold runs regardless.
        drop(self.aggregator.start(&stream_id, self.provider.clone(), request));
        let aggregated = tokio::select! {
            _ = cancel.cancelled() => {
                self.aggregator.clear(&stream_id);
                return Err(OrchestratorError::Cancelled);
            }
            aggregated = self.aggregator.await_aggregated(&stream_id, self.idle) => aggregated,
        };
        self.aggregator.clear(&stream_id);
        if let Some(error) = &aggregated.error {
            debug!(step_id, error = %error, "decision stream failed");
        }
        Ok(Decision::from_aggregated(&aggregated, client_tools))
    }
}

/// Streams the final answer to subscribers and returns its text.
pub struct ContinuationService {
    provider: Arc<dyn ChatProvider>,
    aggregator: Arc<StreamAggregator>,
    hub: Arc<EventHub>,
    idle: Duration,
}

impl ContinuationService {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        aggregator: Arc<StreamAggregator>,
        hub: Arc<EventHub>,
        idle: Duration,
    ) -> Self {
        Self {
            provider,
            aggregator,
            hub,
            idle,
        }
    }

    /// Stream `request` under the step id, forwarding tokens to the hub.
    ///
    /// Returns once the stream ended or went idle and the forwarded tokens
    /// (and `[DONE]`) are in the step channel.
    pub async fn stream_answer(
        &self,
        step_id: &str,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<String> {
        let tokens = self.aggregator.start(step_id, self.provider.clone(), request);
        let forward = self.hub.forward(step_id, tokens);

        let aggregated = tokio::select! {
            _ = cancel.cancelled() => None,
            aggregated = self.aggregator.await_aggregated(step_id, self.idle) => Some(aggregated),
        };
        // Releasing the stream ends the forwarded subscription.
        self.aggregator.clear(step_id);
        if let Some(forward) = forward {
            forward.finished().await;
        }
        let aggregated = aggregated.ok_or(OrchestratorError::Cancelled)?;

        let text = aggregated.final_text();
        match &aggregated.error {
            Some(error) if text.trim().is_empty() => {
                Ok(format!("{} {}", STREAM_ERROR_PREFIX, error))
            }
            _ => Ok(text.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{EventKind, HubOptions};
    use crate::provider::ChunkStream;
    use anyhow::Result;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::{json, Value};

    struct Scripted {
        chunks: Vec<String>,
        fail_stream: bool,
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        async fn complete(&self, _request: &ChatRequest) -> Result<Value> {
            Ok(json!({"choices": [{"message": {"content": "from completion"}}]}))
        }

        async fn stream(&self, _request: &ChatRequest) -> Result<ChunkStream> {
            if self.fail_stream {
                anyhow::bail!("connection refused");
            }
            let items: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures_util::stream::iter(items)))
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    fn delta(text: &str) -> String {
        json!({"choices": [{"delta": {"content": text}}]}).to_string()
    }

    #[tokio::test]
    async fn test_streamed_decision_with_tool_call() {
        let chunk = json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "a", "function": {"name": "search", "arguments": "{\"q\":1}"}}
        ]}}]})
        .to_string();
        let provider = Arc::new(Scripted {
            chunks: vec![chunk],
            fail_stream: false,
        });
        let aggregator = Arc::new(StreamAggregator::default());
        let service =
            DecisionService::new(provider, aggregator.clone(), true, Duration::from_secs(5));

        let decision = service
            .decide("s1", ChatRequest::default(), &HashSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision.tool_calls.len(), 1);
        assert_eq!(decision.tool_calls[0].arguments_value(), json!({"q": 1}));
        assert!(!aggregator.is_started(&decision_stream_id("s1")));
    }

    #[tokio::test]
    async fn test_completion_decision() {
        let provider = Arc::new(Scripted {
            chunks: vec![],
            fail_stream: false,
        });
        let service = DecisionService::new(
            provider,
            Arc::new(StreamAggregator::default()),
            false,
            Duration::from_secs(5),
        );
        let decision = service
            .decide("s1", ChatRequest::default(), &HashSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision.draft.as_deref(), Some("from completion"));
    }

    #[tokio::test]
    async fn test_answer_forwards_tokens_then_done() {
        let provider = Arc::new(Scripted {
            chunks: vec![delta("Hel"), delta("lo")],
            fail_stream: false,
        });
        let hub = Arc::new(EventHub::new(HubOptions::default()));
        let mut events = hub.subscribe("s1");
        let service = ContinuationService::new(
            provider,
            Arc::new(StreamAggregator::default()),
            hub.clone(),
            Duration::from_secs(5),
        );

        let text = service
            .stream_answer("s1", ChatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "Hello");

        let mut tokens = Vec::new();
        while let Some(event) = events.next().await {
            assert_eq!(event.kind, EventKind::Message);
            let done = event.is_done_marker();
            tokens.push(event.data());
            if done {
                break;
            }
        }
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[2], "[DONE]");
    }

    #[tokio::test]
    async fn test_answer_stream_error_text() {
        let provider = Arc::new(Scripted {
            chunks: vec![],
            fail_stream: true,
        });
        let service = ContinuationService::new(
            provider,
            Arc::new(StreamAggregator::default()),
            Arc::new(EventHub::new(HubOptions::default())),
            Duration::from_secs(5),
        );
        let text = service
            .stream_answer("s1", ChatRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "[stream error] connection refused");
    }
}
