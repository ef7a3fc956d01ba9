//! Model provider abstraction.
//!
//! [`ChatProvider`] is the seam between the orchestrator and a concrete
//! model endpoint. The `http-provider` feature adds an OpenAI-compatible
//! implementation over `reqwest`.

pub mod traits;

#[cfg(feature = "http-provider")]
pub mod http;

pub use traits::{ChatProvider, ChatRequest, ChunkStream};

#[cfg(feature = "http-provider")]
pub use http::HttpChatProvider;
