//! Model context assembly

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::ledger::{sha256_hex, to_canonical_json};

use super::memory::{MemoryMessage, MemoryStore};
use super::types::{Step, StepRequest};

/// Messages for the next model call plus a hash identifying them.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub model_messages: Vec<Value>,
    pub context_hash: String,
}

impl AssembledContext {
    /// Hash the canonical form of `messages`.
    pub fn from_messages(messages: Vec<Value>) -> Self {
        let context_hash = sha256_hex(&to_canonical_json(&Value::Array(messages.clone())));
        Self {
            model_messages: messages,
            context_hash,
        }
    }
}

/// Builds the model input for one iteration.
#[async_trait]
pub trait ContextAssembler: Send + Sync {
    async fn assemble(&self, step: &Step, request: &StepRequest) -> Result<AssembledContext>;
}

/// Assembles context from recent conversation memory.
pub struct MemoryContextAssembler {
    memory: Arc<dyn MemoryStore>,
    system_prompt: Option<String>,
    limit: usize,
}

impl MemoryContextAssembler {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            memory,
            system_prompt: None,
            limit: 50,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }
}

/// OpenAI chat message for a stored memory message.
pub fn to_model_message(message: &MemoryMessage) -> Value {
    let payload = message.payload.as_ref();
    match message.role.as_str() {
        "tool" => json!({
            "role": "tool",
            "tool_call_id": payload
                .and_then(|p| p.get("tool_call_id"))
                .cloned()
                .unwrap_or(Value::Null),
            "content": message.content,
        }),
        "assistant" => match payload.and_then(|p| p.get("tool_calls")) {
            Some(calls) => json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": calls,
            }),
            None => json!({"role": "assistant", "content": message.content}),
        },
        role => json!({"role": role, "content": message.content}),
    }
}

#[async_trait]
impl ContextAssembler for MemoryContextAssembler {
    async fn assemble(&self, _step: &Step, request: &StepRequest) -> Result<AssembledContext> {
        let history = self
            .memory
            .recent(&request.user_id, &request.conversation_id, self.limit)
            .await?;
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.extend(history.iter().map(to_model_message));
        Ok(AssembledContext::from_messages(messages))
    }
}
