//! Streaming aggregation of provider deltas.
//!
//! [`StreamAggregator`] turns a provider's incremental chunks into a live
//! re-broadcast and a converged [`Aggregated`] value. The folding rules live
//! in [`accumulator`] as a pure function.

pub mod accumulator;
pub mod aggregator;

pub use accumulator::{fold, Accumulator, Aggregated, AggregatedToolCall, ToolCallAccumulator};
pub use aggregator::{StreamAggregator, TokenStream};
