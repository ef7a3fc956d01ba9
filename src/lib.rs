//! Stepflow - agent step orchestration toolkit
//!
//! Stepflow provides feature-gated building blocks for driving one agent
//! "step" from a user request to a final answer:
//!
//! - **`config`** - TOML configuration and environment loading
//! - **`observability`** - Markdown step transcripts on top of `tracing`
//! - **`ledger`** - Fingerprint-based idempotent tool execution with an audit chain
//! - **`stream`** - Aggregation of streamed provider deltas
//! - **`hub`** - Per-step SSE event channels with heartbeat and idle eviction
//! - **`store`** - Ephemeral per-step bookkeeping
//! - **`provider`** - Chat provider traits (`http-provider` adds a `reqwest` client)
//! - **`orchestration`** - The step loop tying everything together
//!
//! # Features
//!
//! Enable the features you need in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! stepflow = { version = "0.3", features = ["ledger"] }
//! # Or just the hub and the aggregator:
//! stepflow = { version = "0.3", features = ["hub", "stream"] }
//! # Or enable everything:
//! stepflow = { version = "0.3", features = ["all"] }
//! ```
//!
//! # Example: Running a step
//!
//! ```ignore
//! use std::sync::Arc;
//! use stepflow::config::ConfigurationLoader;
//! use stepflow::orchestration::{OrchestratorBuilder, StepRequest};
//! use stepflow::provider::HttpChatProvider;
//! use tokio_util::sync::CancellationToken;
//!
//! let loader = ConfigurationLoader::new(None)?;
//! let provider = Arc::new(HttpChatProvider::from_config(&loader.config.provider, &env)?);
//! let orchestrator = Arc::new(
//!     OrchestratorBuilder::from_configuration(&loader.config, provider, my_tools)?.build(),
//! );
//!
//! let run = orchestrator.run(
//!     StepRequest::new("user-1", "conv-1").with_query("Plan my trip"),
//!     CancellationToken::new(),
//! );
//! let sse = orchestrator.subscribe(run.step_id());
//! ```
//!
//! # Example: Idempotent execution on its own
//!
//! ```ignore
//! use stepflow::ledger::{ExecuteOptions, IdempotencyLedger, LedgerKey};
//!
//! let ledger = IdempotencyLedger::default();
//! let fp = ledger.fingerprinter().fingerprint("search", &args, &context_hash);
//! let out = ledger
//!     .execute_once(&LedgerKey::new("u:c", "search", fp), &args, ExecuteOptions::default(), run)
//!     .await?;
//! ```

#![warn(missing_docs)]

/// Configuration management (enabled with the `config` feature)
#[cfg(feature = "config")]
pub mod config;

/// Observability utilities (enabled with the `observability` feature)
#[cfg(feature = "observability")]
pub mod observability;

/// Idempotency ledger and audit chain (enabled with the `ledger` feature)
#[cfg(feature = "ledger")]
pub mod ledger;

/// Chat provider abstraction (enabled with the `provider` feature)
#[cfg(feature = "provider")]
pub mod provider;

/// Stream aggregation (enabled with the `stream` feature)
#[cfg(feature = "stream")]
pub mod stream;

/// Per-step event hub (enabled with the `hub` feature)
#[cfg(feature = "hub")]
pub mod hub;

/// Tool call and result types (enabled with the `store` feature)
#[cfg(feature = "store")]
pub mod model;

/// Step context store (enabled with the `store` feature)
#[cfg(feature = "store")]
pub mod store;

/// Step orchestration (enabled with the `orchestration` feature)
#[cfg(feature = "orchestration")]
pub mod orchestration;

/// Prelude module for convenient imports
pub mod prelude {
    #[cfg(feature = "config")]
    pub use crate::config::{Configuration, ConfigurationLoader, EnvironmentLoader};

    #[cfg(feature = "observability")]
    pub use crate::observability::Logger;

    #[cfg(feature = "ledger")]
    pub use crate::ledger::{ExecuteOptions, Fingerprinter, IdempotencyLedger, LedgerKey};

    #[cfg(feature = "provider")]
    pub use crate::provider::{ChatProvider, ChatRequest, ChunkStream};

    #[cfg(feature = "stream")]
    pub use crate::stream::{Aggregated, StreamAggregator};

    #[cfg(feature = "hub")]
    pub use crate::hub::{EventHub, EventKind, HubEvent, HubOptions};

    #[cfg(feature = "store")]
    pub use crate::model::{ExecTarget, ToolCall, ToolResult, ToolStatus};

    #[cfg(feature = "store")]
    pub use crate::store::StepContextStore;

    #[cfg(feature = "orchestration")]
    pub use crate::orchestration::{
        MemoryStore, OrchestratorBuilder, OrchestratorError, StepEvent, StepOrchestrator,
        StepRequest, StepRun, ToolExecutor,
    };
}
