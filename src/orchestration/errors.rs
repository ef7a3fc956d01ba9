//! Error types for the step orchestrator.

use thiserror::Error;

/// Errors raised by the orchestrator's own control flow.
///
/// Tool and stream failures never surface here; they become error-shaped
/// results or events.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Tool '{name}' failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("Tool '{name}' timed out after {seconds}s")]
    ToolTimeout { name: String, seconds: u64 },

    #[error("DISABLED: tool disabled by runtime config ({0})")]
    ToolDisabled(String),

    #[error("Context assembly failed: {0}")]
    ContextAssembly(String),

    #[error("Memory store error: {0}")]
    Memory(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step cancelled")]
    Cancelled,

    #[error("Invalid step transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn provider<S: Into<String>>(message: S) -> Self {
        Self::Provider(message.into())
    }

    pub fn context<S: Into<String>>(message: S) -> Self {
        Self::ContextAssembly(message.into())
    }

    pub fn memory<S: Into<String>>(message: S) -> Self {
        Self::Memory(message.into())
    }

    pub fn transition<S: Into<String>>(message: S) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Failures a later request for the same step may get past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_)
                | Self::ToolExecution { .. }
                | Self::ToolTimeout { .. }
                | Self::ContextAssembly(_)
                | Self::Memory(_)
                | Self::Io(_)
        )
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
