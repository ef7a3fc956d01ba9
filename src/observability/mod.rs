//! Observability utilities for step runs.
//!
//! Step runs emit `tracing` events for the process log and can also keep a
//! markdown transcript per run through [`Logger`].
//!
//! # Example
//!
//! ```no_run
//! use stepflow::observability::Logger;
//! use serde_json::json;
//!
//! let logger = Logger::new(None, Some("DEBUG")).unwrap();
//! logger.log_step_started("step-1", "user-1", "conv-1", 0).unwrap();
//! logger.log_decision("step-1", 0, &json!([])).unwrap();
//! logger.log_step_finished("step-1", 1, "DONE").unwrap();
//! ```

pub mod logger;

pub use logger::Logger;
