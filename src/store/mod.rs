//! Step context store.
//!
//! Ephemeral bookkeeping keyed by step id: identity binding, planned calls,
//! the deferred/dispatched/ingested client-call lifecycle, once-markers and
//! the loop state parked while a step waits on its client.

pub mod step_store;

pub use step_store::{StepBinding, StepContextStore, SuspendedStep};
