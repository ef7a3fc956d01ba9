//! Per-step event hub.
//!
//! Each step owns one multicast channel that merges control events emitted
//! by the orchestrator with forwarded token streams. Subscribers may attach
//! before the step exists, lagging subscribers lose the oldest events, and a
//! janitor force-completes channels that stay idle past their TTL.
//!
//! # Example
//!
//! ```no_run
//! use stepflow::hub::{EventHub, EventKind};
//! use serde_json::json;
//!
//! # async fn example() {
//! let hub = EventHub::default();
//! let events = hub.subscribe("step-1");
//! hub.emit("step-1", EventKind::Started, json!({"stepId": "step-1", "loop": 0}));
//! hub.complete("step-1");
//! # drop(events);
//! # }
//! ```

pub mod event;
pub mod event_hub;

pub use event::{EventKind, HubEvent, DONE_MARKER};
pub use event_hub::{EventHub, EventStream, ForwardHandle, ForwardStream, HubOptions};
