//! Step orchestrator runtime - the RUNNING -> DONE | WAIT_CLIENT loop

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Configuration, EnvironmentLoader, OrchestratorConfig};
use crate::hub::{EventHub, EventStream, HubOptions};
use crate::ledger::IdempotencyLedger;
use crate::model::{ToolCall, ToolResult};
use crate::provider::{ChatProvider, ChatRequest};
use crate::store::{StepContextStore, SuspendedStep};
use crate::stream::StreamAggregator;

#[cfg(feature = "observability")]
use crate::observability::Logger;

use super::context::{AssembledContext, ContextAssembler, MemoryContextAssembler};
use super::decision::{decision_stream_id, ContinuationService, DecisionService};
use super::errors::{OrchestratorError, OrchestratorResult};
use super::events::{FinishReason, StepEvent, StepEventBody, PHASE_CLIENT_WAIT};
use super::ingest::{batch_hash, ingest_client_results, tool_message_content};
use super::memory::{InMemoryMemoryStore, MemoryMessage, MemoryStore};
use super::tools::{ToolExecutor, ToolPipeline, ToolScope};
use super::types::{Decision, FinishState, Step, StepRequest};

/// Per-run state shared by every iteration of one step run.
struct RunContext {
    request: StepRequest,
    client_tools: HashSet<String>,
    tx: mpsc::UnboundedSender<StepEvent>,
    cancel: CancellationToken,
    /// First iteration of a resumed run
    resumed: bool,
}

impl RunContext {
    fn user_id(&self) -> &str {
        &self.request.user_id
    }

    fn conversation_id(&self) -> &str {
        &self.request.conversation_id
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Handle to a running step: its id and its NDJSON event sink.
///
/// Dropping the handle cancels the run.
pub struct StepRun {
    step_id: String,
    events: mpsc::UnboundedReceiver<StepEvent>,
    task: JoinHandle<()>,
}

impl StepRun {
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Next event, `None` once the run ended.
    pub async fn next(&mut self) -> Option<StepEvent> {
        self.events.recv().await
    }

    /// Drain every event until the run ends.
    pub async fn collect(mut self) -> Vec<StepEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        if let Err(e) = (&mut self.task).await {
            warn!(step_id = %self.step_id, error = %e, "step task failed");
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = StepEvent> + Send {
        futures_util::stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }

    /// Events as newline-terminated NDJSON lines.
    pub fn into_ndjson(self) -> impl Stream<Item = String> + Send {
        self.into_stream()
            .filter_map(|event| async move { event.to_ndjson_line().ok() })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Counts from one maintenance sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub hub_channels: usize,
    pub steps: usize,
    pub ledger_entries: usize,
}

/// Drives steps: decide, execute server tools, hand client tools back,
/// and finish with one streamed answer.
pub struct StepOrchestrator {
    config: OrchestratorConfig,
    hub: Arc<EventHub>,
    aggregator: Arc<StreamAggregator>,
    store: Arc<StepContextStore>,
    ledger: Arc<IdempotencyLedger>,
    memory: Arc<dyn MemoryStore>,
    assembler: Arc<dyn ContextAssembler>,
    tools: ToolPipeline,
    decisions: DecisionService,
    continuation: ContinuationService,
    shutdown: CancellationToken,
    #[cfg(feature = "observability")]
    logger: Option<Arc<Logger>>,
}

/// Assembles a [`StepOrchestrator`]; unset parts get in-process defaults.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    provider: Arc<dyn ChatProvider>,
    executor: Arc<dyn ToolExecutor>,
    memory: Option<Arc<dyn MemoryStore>>,
    assembler: Option<Arc<dyn ContextAssembler>>,
    hub: Option<Arc<EventHub>>,
    aggregator: Option<Arc<StreamAggregator>>,
    store: Option<Arc<StepContextStore>>,
    ledger: Option<Arc<IdempotencyLedger>>,
    #[cfg(feature = "observability")]
    logger: Option<Arc<Logger>>,
}

impl OrchestratorBuilder {
    pub fn new(provider: Arc<dyn ChatProvider>, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            config: OrchestratorConfig::default(),
            provider,
            executor,
            memory: None,
            assembler: None,
            hub: None,
            aggregator: None,
            store: None,
            ledger: None,
            #[cfg(feature = "observability")]
            logger: None,
        }
    }

    /// Builder preloaded from a full configuration.
    ///
    /// `STEPFLOW_MODEL` overrides the configured model. A transcript logger
    /// is attached when `logging.log_file` is set.
    pub fn from_configuration(
        configuration: &Configuration,
        provider: Arc<dyn ChatProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> anyhow::Result<Self> {
        let mut config = configuration.orchestrator.clone();
        if let Some(model) = EnvironmentLoader::new(None).model_override() {
            config.model = model;
        }
        let builder = Self::new(provider, executor)
            .config(config)
            .hub(Arc::new(EventHub::new(HubOptions::from(&configuration.hub))))
            .aggregator(Arc::new(StreamAggregator::new(configuration.hub.buffer_capacity)))
            .ledger(Arc::new(IdempotencyLedger::from_config(&configuration.ledger)));

        #[cfg(feature = "observability")]
        let builder = if configuration.logging.log_file.trim().is_empty() {
            builder
        } else {
            builder.logger(Arc::new(Logger::from_config(&configuration.logging)?))
        };

        Ok(builder)
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn assembler(mut self, assembler: Arc<dyn ContextAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    pub fn hub(mut self, hub: Arc<EventHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<StreamAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn store(mut self, store: Arc<StepContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<IdempotencyLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[cfg(feature = "observability")]
    pub fn logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> StepOrchestrator {
        let config = self.config;
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(InMemoryMemoryStore::new()));
        let assembler = self.assembler.unwrap_or_else(|| {
            Arc::new(
                MemoryContextAssembler::new(memory.clone())
                    .with_system_prompt(config.system_prompt.clone())
                    .with_limit(config.context_limit),
            )
        });
        let hub = self.hub.unwrap_or_default();
        let aggregator = self.aggregator.unwrap_or_default();
        let ledger = self.ledger.unwrap_or_default();
        let tools = ToolPipeline::new(self.executor, ledger.clone())
            .with_concurrency(config.tool_concurrency)
            .with_timeout(config.tool_timeout())
            .with_disabled(config.disabled_tools.clone());
        let decisions = DecisionService::new(
            self.provider.clone(),
            aggregator.clone(),
            config.stream_decision,
            config.decision_idle_timeout(),
        );
        let continuation = ContinuationService::new(
            self.provider,
            aggregator.clone(),
            hub.clone(),
            config.stream_idle_timeout(),
        );

        StepOrchestrator {
            config,
            hub,
            aggregator,
            store: self.store.unwrap_or_default(),
            ledger,
            memory,
            assembler,
            tools,
            decisions,
            continuation,
            shutdown: CancellationToken::new(),
            #[cfg(feature = "observability")]
            logger: self.logger,
        }
    }
}

impl StepOrchestrator {
    pub fn builder(
        provider: Arc<dyn ChatProvider>,
        executor: Arc<dyn ToolExecutor>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(provider, executor)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn aggregator(&self) -> &Arc<StreamAggregator> {
        &self.aggregator
    }

    pub fn store(&self) -> &Arc<StepContextStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    /// Subscribe to a step's SSE events. The step need not have started.
    pub fn subscribe(&self, step_id: &str) -> EventStream {
        self.hub.subscribe(step_id)
    }

    /// Rebuild a conversation from memory, or its history up to one step.
    pub async fn replay(
        &self,
        user_id: &str,
        conversation_id: &str,
        up_to_step: Option<&str>,
        limit: usize,
    ) -> OrchestratorResult<Vec<StepEvent>> {
        super::replay::replay(self.memory.as_ref(), user_id, conversation_id, up_to_step, limit)
            .await
    }

    /// Start a step. Resumes `resume_step_id` when set, otherwise a fresh id
    /// is generated.
    pub fn run(self: &Arc<Self>, request: StepRequest, cancel: CancellationToken) -> StepRun {
        let step_id = request
            .resume_step_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("step-{}", uuid::Uuid::new_v4()));
        self.run_step(step_id, request, cancel)
    }

    /// Start a step under a caller-chosen id.
    pub fn run_step(
        self: &Arc<Self>,
        step_id: impl Into<String>,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> StepRun {
        let step_id = step_id.into();
        let (tx, events) = mpsc::unbounded_channel();
        let orchestrator = self.clone();
        let id = step_id.clone();
        let cancel = cancel.child_token();
        let task = tokio::spawn(async move {
            let sink = tx.clone();
            let run = orchestrator.clone().drive(id.clone(), request, tx, cancel);
            if let Err(panic) = futures_util::FutureExt::catch_unwind(AssertUnwindSafe(run)).await {
                orchestrator.abort_panicked(&id, panic_message(panic.as_ref()), &sink);
            }
        });
        StepRun {
            step_id,
            events,
            task,
        }
    }

    async fn drive(
        self: Arc<Self>,
        step_id: String,
        request: StepRequest,
        tx: mpsc::UnboundedSender<StepEvent>,
        cancel: CancellationToken,
    ) {
        // A consumer that goes away cancels the run.
        let _cancel_on_exit = cancel.clone().drop_guard();
        let watcher = {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tx.closed() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let mut run = RunContext {
            client_tools: request.client_tool_names(),
            resumed: request.resume_step_id.is_some(),
            request,
            tx,
            cancel,
        };
        let mut step = self.initial_step(&step_id, &run.request);
        let max_loops = self.config.effective_max_loops();

        info!(
            step_id = %step_id,
            loop_count = step.loop_count,
            resumed = run.resumed,
            "step run started"
        );
        self.emit(
            &run,
            step.loop_count,
            StepEventBody::Started {
                step_id: step_id.clone(),
                loop_count: step.loop_count,
            },
        );

        loop {
            let state = step.finish;
            match state {
                FinishState::WaitClient => {
                    self.store.suspend(
                        &step_id,
                        SuspendedStep {
                            loop_count: step.loop_count,
                            executed_keys: step.executed_keys.clone(),
                            context_hash: step.context_hash.clone(),
                        },
                    );
                    self.emit(
                        &run,
                        step.loop_count,
                        StepEventBody::Status {
                            step_id: step_id.clone(),
                            phase: PHASE_CLIENT_WAIT.to_string(),
                        },
                    );
                    break;
                }
                FinishState::Done => {
                    self.finish(&run, step, FinishReason::Done).await;
                    break;
                }
                FinishState::Running if step.loop_count >= max_loops => {
                    warn!(step_id = %step_id, loop_count = step.loop_count, "max loops reached");
                    self.finish(&run, step.abandon_pending(), FinishReason::MaxLoops)
                        .await;
                    break;
                }
                FinishState::Running => {}
            }

            if run.is_cancelled() {
                info!(step_id = %step_id, "step cancelled");
                self.log_outcome(&step_id, step.loop_count, "CANCELLED");
                self.teardown(&step_id);
                break;
            }

            let loop_count = step.loop_count;
            let outcome = self.iterate(step, &run).await;
            run.resumed = false;
            match outcome {
                Ok(next) => step = next,
                Err(OrchestratorError::Cancelled) => {
                    info!(step_id = %step_id, "step cancelled");
                    self.log_outcome(&step_id, loop_count, "CANCELLED");
                    self.teardown(&step_id);
                    break;
                }
                Err(e) => {
                    warn!(step_id = %step_id, error = %e, "step failed");
                    self.emit(
                        &run,
                        loop_count,
                        StepEventBody::Error {
                            step_id: step_id.clone(),
                            message: e.to_string(),
                        },
                    );
                    self.teardown(&step_id);
                    break;
                }
            }
        }

        watcher.abort();
    }

    fn initial_step(&self, step_id: &str, request: &StepRequest) -> Step {
        let mut step = Step::new(step_id).with_pending(request.initial_tool_calls());
        if request.resume_step_id.is_some() {
            if let Some(parked) = self.store.take_suspended(step_id) {
                debug!(step_id, loop_count = parked.loop_count, "restoring parked step");
                step.loop_count = parked.loop_count;
                step.executed_keys = parked.executed_keys;
                step.context_hash = parked.context_hash;
            }
        }
        step
    }

    /// One iteration: bookkeeping, then execute pending calls or decide.
    async fn iterate(&self, step: Step, run: &RunContext) -> OrchestratorResult<Step> {
        let step_id = step.step_id.clone();
        self.store
            .bind(&step_id, run.user_id(), run.conversation_id());
        self.persist_user_input(&step_id, run).await;
        self.ingest_client_batch(&step_id, run).await;

        if run.resumed && !step.has_pending() {
            let unsatisfied = self.store.unsatisfied_client_calls(&step_id);
            if !unsatisfied.is_empty() {
                debug!(
                    step_id = %step_id,
                    outstanding = unsatisfied.len(),
                    "client results still missing"
                );
                self.emit(
                    run,
                    step.loop_count,
                    StepEventBody::ClientCalls {
                        step_id: step_id.clone(),
                        calls: unsatisfied.clone(),
                    },
                );
                return step.wait_client(&unsatisfied);
            }
        }

        if step.has_pending() {
            return self.exec_pending(step, run).await;
        }

        let ctx = self.assemble(&step, run).await?;
        let step = step.with_context_hash(ctx.context_hash.clone());
        let request = ChatRequest::new(self.model_for(run), ctx.model_messages.clone())
            .with_tools(self.tools.schemas(), run.request.client_tools.clone())
            .with_tool_choice(
                run.request
                    .tool_choice
                    .clone()
                    .unwrap_or_else(|| "auto".to_string()),
            );
        let decision = self
            .decisions
            .decide(&step_id, request, &run.client_tools, &run.cancel)
            .await?;
        self.apply_decision(step, decision, &ctx, run).await
    }

    async fn apply_decision(
        &self,
        step: Step,
        decision: Decision,
        ctx: &AssembledContext,
        run: &RunContext,
    ) -> OrchestratorResult<Step> {
        let step_id = step.step_id.clone();
        if decision.tool_calls.is_empty() {
            return match decision.draft {
                Some(draft) => self.answer(step, draft, run).await,
                None => self.continue_answer(step, ctx, run).await,
            };
        }

        self.store.save_planned_calls(&step_id, &decision.tool_calls);
        let (server, client) = decision.partition();
        self.store.save_client_calls(&step_id, &client);
        self.emit(
            run,
            step.loop_count,
            StepEventBody::Decision {
                step_id: step_id.clone(),
                tool_calls: decision.tool_calls.clone(),
            },
        );

        let pending = self.fresh_server_calls(&step, server, run);
        let mut answered: Vec<ToolCall> = pending.clone();
        answered.extend(client);
        self.persist_decision(&step_id, &decision, &answered, run).await;

        if !pending.is_empty() {
            debug!(step_id = %step_id, pending = pending.len(), "server calls queued");
            return Ok(step.with_pending(pending));
        }
        if let Some(calls) = self.dispatch_client_calls(&step, run) {
            return step.wait_client(&calls);
        }
        match decision.draft {
            Some(draft) => self.answer(step, draft, run).await,
            None => self.continue_answer(step, ctx, run).await,
        }
    }

    /// Server calls not yet executed in this step, first occurrence wins.
    fn fresh_server_calls(
        &self,
        step: &Step,
        server: Vec<ToolCall>,
        run: &RunContext,
    ) -> Vec<ToolCall> {
        let scope = self.scope_for(step, run);
        let mut seen = HashSet::new();
        server
            .into_iter()
            .filter(|call| {
                let key = self.tools.prepare(call, &scope).executed_key;
                if step.executed_keys.contains(&key) {
                    debug!(tool = %call.name, "skipping call already executed in this step");
                    return false;
                }
                seen.insert(key)
            })
            .collect()
    }

    async fn exec_pending(&self, step: Step, run: &RunContext) -> OrchestratorResult<Step> {
        let step = if step.context_hash.is_some() {
            step
        } else {
            let ctx = self.assemble(&step, run).await?;
            step.with_context_hash(ctx.context_hash)
        };
        let step_id = step.step_id.clone();
        let scope = self.scope_for(&step, run);
        let started = Instant::now();

        // Dispatched calls keep running after a cancel; their results are dropped.
        let results = tokio::select! {
            _ = run.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            results = self.tools.execute_batch(step.pending.clone(), &scope) => results,
        };
        debug!(
            step_id = %step_id,
            calls = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool batch finished"
        );

        self.persist_tool_results(&step_id, &results, run).await;
        self.store.save_tool_results(&step_id, &results);
        let executed: Vec<String> = results
            .iter()
            .filter_map(|r| r.executed_key.clone())
            .collect();
        self.emit(
            run,
            step.loop_count,
            StepEventBody::Tools {
                step_id: step_id.clone(),
                results,
            },
        );

        let step = step.with_executed(executed);
        match self.dispatch_client_calls(&step, run) {
            Some(calls) => step.wait_client(&calls),
            None => Ok(step.next_loop()),
        }
    }

    /// Hand deferred client calls to the client, if any.
    fn dispatch_client_calls(&self, step: &Step, run: &RunContext) -> Option<Vec<ToolCall>> {
        let calls = self.store.poll_client_calls(&step.step_id);
        if calls.is_empty() {
            return None;
        }
        self.emit(
            run,
            step.loop_count,
            StepEventBody::ClientCalls {
                step_id: step.step_id.clone(),
                calls: calls.clone(),
            },
        );
        Some(calls)
    }

    async fn continue_answer(
        &self,
        step: Step,
        ctx: &AssembledContext,
        run: &RunContext,
    ) -> OrchestratorResult<Step> {
        let request = ChatRequest::new(self.model_for(run), ctx.model_messages.clone())
            .with_tool_choice("none");
        let text = self
            .continuation
            .stream_answer(&step.step_id, request, &run.cancel)
            .await?;
        self.answer(step, text, run).await
    }

    async fn answer(&self, step: Step, text: String, run: &RunContext) -> OrchestratorResult<Step> {
        let step_id = step.step_id.clone();
        self.append_memory(&step_id, run, "assistant", text.clone(), json!({
            "source": "model",
            "type": "assistant_answer",
            "stepId": step_id,
        }))
        .await;
        self.emit(
            run,
            step.loop_count,
            StepEventBody::Assistant {
                step_id: step_id.clone(),
                text,
            },
        );
        step.done()
    }

    /// Forced or natural terminal path: promote drafts, announce, tear down.
    async fn finish(&self, run: &RunContext, step: Step, reason: FinishReason) {
        if let Err(e) = self
            .memory
            .promote_drafts_to_final(run.user_id(), run.conversation_id(), &step.step_id)
            .await
        {
            warn!(step_id = %step.step_id, error = %e, "draft promotion failed");
        }
        self.emit(
            run,
            step.loop_count,
            StepEventBody::Finished {
                step_id: step.step_id.clone(),
                loop_count: step.loop_count,
                reason,
            },
        );
        self.teardown(&step.step_id);
    }

    /// Close out a run whose loop panicked: one `error` event, then the usual
    /// teardown.
    fn abort_panicked(
        &self,
        step_id: &str,
        message: String,
        tx: &mpsc::UnboundedSender<StepEvent>,
    ) {
        warn!(step_id, panic = %message, "step panicked");
        let event = StepEvent::new(StepEventBody::Error {
            step_id: step_id.to_string(),
            message: format!("step panicked: {}", message),
        });
        self.hub
            .emit(event.step_id(), event.hub_kind(), event.hub_payload());
        if tx.send(event).is_err() {
            debug!("event sink closed");
        }
        self.log_outcome(step_id, 0, "PANICKED");
        self.teardown(step_id);
    }

    fn teardown(&self, step_id: &str) {
        self.hub.complete(step_id);
        self.aggregator.clear(step_id);
        self.aggregator.clear(&decision_stream_id(step_id));
        self.store.clear(step_id);
    }

    async fn assemble(
        &self,
        step: &Step,
        run: &RunContext,
    ) -> OrchestratorResult<AssembledContext> {
        self.assembler
            .assemble(step, &run.request)
            .await
            .map_err(|e| OrchestratorError::context(e.to_string()))
    }

    fn scope_for(&self, step: &Step, run: &RunContext) -> ToolScope {
        ToolScope::new(
            run.user_id(),
            run.conversation_id(),
            step.context_hash.clone().unwrap_or_default(),
        )
    }

    fn model_for(&self, run: &RunContext) -> String {
        run.request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.model.clone())
    }

    // === Memory ===

    async fn persist_user_input(&self, step_id: &str, run: &RunContext) {
        let Some(q) = run.request.query() else { return };
        if !self.store.mark_user_input_once(step_id) {
            return;
        }
        let message =
            MemoryMessage::draft(run.user_id(), run.conversation_id(), step_id, 1, "user", q);
        if let Err(e) = self.memory.upsert_message(message).await {
            warn!(step_id, error = %e, "user input not persisted");
        }
    }

    async fn ingest_client_batch(&self, step_id: &str, run: &RunContext) {
        let items = &run.request.client_results;
        if items.is_empty() || !self.store.mark_client_batch_once(step_id, &batch_hash(items)) {
            return;
        }
        let ingested = ingest_client_results(
            &self.store,
            self.memory.as_ref(),
            step_id,
            run.user_id(),
            run.conversation_id(),
            items,
        )
        .await;
        debug!(step_id, ingested = ingested.len(), "client results ingested");
    }

    async fn persist_decision(
        &self,
        step_id: &str,
        decision: &Decision,
        answered: &[ToolCall],
        run: &RunContext,
    ) {
        if answered.is_empty() {
            return;
        }
        let tool_calls: Vec<Value> = answered.iter().map(ToolCall::to_openai).collect();
        self.append_memory(
            step_id,
            run,
            "assistant",
            decision.draft.clone().unwrap_or_default(),
            json!({
                "source": "model",
                "type": "assistant_decision",
                "stepId": step_id,
                "tool_calls": tool_calls,
            }),
        )
        .await;
    }

    async fn persist_tool_results(&self, step_id: &str, results: &[ToolResult], run: &RunContext) {
        for result in results {
            self.append_memory(
                step_id,
                run,
                "tool",
                tool_message_content(&result.data),
                json!({
                    "source": "server",
                    "tool_call_id": result.call_id,
                    "name": result.name,
                    "status": result.status,
                    "reused": result.reused,
                }),
            )
            .await;
        }
    }

    /// Append a draft at `max(seq) + 1`. Failures are logged, not raised.
    async fn append_memory(
        &self,
        step_id: &str,
        run: &RunContext,
        role: &str,
        content: String,
        payload: Value,
    ) {
        let seq = match self
            .memory
            .find_max_seq(run.user_id(), run.conversation_id(), step_id)
            .await
        {
            Ok(max) => max.unwrap_or(0) + 1,
            Err(e) => {
                warn!(step_id, error = %e, "memory lookup failed");
                return;
            }
        };
        let message = MemoryMessage::draft(
            run.user_id(),
            run.conversation_id(),
            step_id,
            seq,
            role,
            content,
        )
        .with_payload(payload);
        if let Err(e) = self.memory.upsert_message(message).await {
            warn!(step_id, role, error = %e, "memory write failed");
        }
    }

    // === Events ===

    /// Send to the NDJSON sink and mirror to the hub.
    fn emit(&self, run: &RunContext, loop_count: u32, body: StepEventBody) {
        let event = StepEvent::new(body);
        self.hub
            .emit(event.step_id(), event.hub_kind(), event.hub_payload());
        self.log_event(&event, loop_count, &run.request);
        if run.tx.send(event).is_err() {
            debug!("event sink closed");
        }
    }

    #[cfg(feature = "observability")]
    fn log_event(&self, event: &StepEvent, loop_count: u32, request: &StepRequest) {
        let Some(logger) = &self.logger else { return };
        let step_id = event.step_id();
        let written = match &event.body {
            StepEventBody::Started { .. } => logger.log_step_started(
                step_id,
                &request.user_id,
                &request.conversation_id,
                loop_count,
            ),
            StepEventBody::Decision { .. } => {
                logger.log_decision(step_id, loop_count, &event.data()["toolCalls"])
            }
            StepEventBody::Tools { .. } => {
                logger.log_tool_results(step_id, &event.data()["results"])
            }
            StepEventBody::ClientCalls { .. } => {
                logger.log_client_calls(step_id, &event.data()["calls"])
            }
            StepEventBody::Assistant { text, .. } => logger.log_assistant(step_id, text),
            StepEventBody::Finished { reason, .. } => logger.log_step_finished(
                step_id,
                loop_count,
                match reason {
                    FinishReason::Done => "DONE",
                    FinishReason::MaxLoops => "MAX_LOOPS",
                },
            ),
            StepEventBody::Status { phase, .. } if phase == PHASE_CLIENT_WAIT => {
                logger.log_step_finished(step_id, loop_count, "WAIT_CLIENT")
            }
            StepEventBody::Status { .. } | StepEventBody::Message { .. } => Ok(()),
            StepEventBody::Error { message, .. } => logger.log_error(step_id, message),
        };
        if let Err(e) = written {
            warn!(step_id, error = %e, "transcript write failed");
        }
    }

    #[cfg(not(feature = "observability"))]
    fn log_event(&self, _event: &StepEvent, _loop_count: u32, _request: &StepRequest) {}

    #[cfg(feature = "observability")]
    fn log_outcome(&self, step_id: &str, loop_count: u32, outcome: &str) {
        let Some(logger) = &self.logger else { return };
        if let Err(e) = logger.log_step_finished(step_id, loop_count, outcome) {
            warn!(step_id, error = %e, "transcript write failed");
        }
    }

    #[cfg(not(feature = "observability"))]
    fn log_outcome(&self, _step_id: &str, _loop_count: u32, _outcome: &str) {}

    // === Maintenance ===

    /// Evict idle hub channels, idle step state and expired ledger records.
    pub fn sweep(&self) -> SweepReport {
        let hub_channels = self.hub.sweep();
        let purged = self.store.purge_idle(self.config.step_state_ttl());
        for step_id in &purged {
            self.aggregator.clear(step_id);
            self.aggregator.clear(&decision_stream_id(step_id));
        }
        let report = SweepReport {
            hub_channels,
            steps: purged.len(),
            ledger_entries: self.ledger.purge_expired(),
        };
        if report != SweepReport::default() {
            info!(
                hub_channels = report.hub_channels,
                steps = report.steps,
                ledger_entries = report.ledger_entries,
                "maintenance sweep"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) on the hub's janitor period until
    /// [`shutdown`](Self::shutdown).
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::downgrade(self);
        let every = self.hub.options().janitor_every;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match orchestrator.upgrade() {
                    Some(orchestrator) => {
                        orchestrator.sweep();
                    }
                    None => break,
                }
            }
        })
    }

    /// Stop the janitor and complete every hub channel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.hub.shutdown();
    }
}
