//! Step orchestration - the loop that turns a user request into tool
//! executions and one final answer
//!
//! A step starts RUNNING and ends DONE or WAIT_CLIENT:
//! - the model decides on tool calls, or answers directly
//! - server calls run through the idempotency ledger, ordered and bounded
//! - client calls are handed back and the step parks until results arrive
//! - a step is DONE only when no server call is outstanding
//!
//! Every event goes to the caller's NDJSON stream and is mirrored to the
//! step's hub channel, where the final answer is also streamed token by token.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stepflow::orchestration::{StepOrchestrator, StepRequest, ToolExecutor};
//! use stepflow::provider::ChatProvider;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(provider: Arc<dyn ChatProvider>, tools: Arc<dyn ToolExecutor>) {
//! let orchestrator = Arc::new(StepOrchestrator::builder(provider, tools).build());
//! let _janitor = orchestrator.spawn_janitor();
//!
//! let request = StepRequest::new("user-1", "conv-1").with_query("What's the weather?");
//! let run = orchestrator.run(request, CancellationToken::new());
//! let _sse = orchestrator.subscribe(run.step_id());
//! for event in run.collect().await {
//!     println!("{}", event.to_ndjson_line().unwrap());
//! }
//! # }
//! ```

pub mod context;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ingest;
pub mod memory;
pub mod replay;
pub mod runtime;
pub mod tools;
pub mod types;

pub use context::{AssembledContext, ContextAssembler, MemoryContextAssembler};
pub use decision::{decision_stream_id, ContinuationService, DecisionService, STREAM_ERROR_PREFIX};
pub use errors::{OrchestratorError, OrchestratorResult};
pub use events::{FinishReason, StepEvent, StepEventBody, PHASE_CLIENT_WAIT};
pub use ingest::{normalize_client_result, UNKNOWN_CLIENT_TOOL};
pub use memory::{InMemoryMemoryStore, MemoryMessage, MemoryStore, MessageState};
pub use replay::{replay, replay_messages};
pub use runtime::{OrchestratorBuilder, StepOrchestrator, StepRun, SweepReport};
pub use tools::{ToolExecutor, ToolPipeline, ToolScope, DISABLED_MESSAGE};
pub use types::{Decision, FinishState, Step, StepRequest};
