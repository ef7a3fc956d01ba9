//! Conversation memory seam and an in-process implementation

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Visibility state of a memory message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    /// Written during a running step
    Draft,
    /// Promoted when the step finished
    Final,
}

/// One stored conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryMessage {
    pub user_id: String,
    pub conversation_id: String,
    pub step_id: String,
    /// Position inside the step; the user input is always 1
    pub seq: u32,
    /// `user`, `assistant` or `tool`
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
}

impl MemoryMessage {
    pub fn draft(
        user_id: &str,
        conversation_id: &str,
        step_id: &str,
        seq: u32,
        role: &str,
        content: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            step_id: step_id.to_string(),
            seq,
            role: role.to_string(),
            content: content.into(),
            payload: None,
            state: MessageState::Draft,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn same_slot(&self, other: &MemoryMessage) -> bool {
        self.user_id == other.user_id
            && self.conversation_id == other.conversation_id
            && self.step_id == other.step_id
            && self.seq == other.seq
    }
}

/// Conversation memory used by the orchestrator.
///
/// Messages are addressed by `(user, conversation, step, seq)`; writing the
/// same address twice replaces the earlier message.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn upsert_message(&self, message: MemoryMessage) -> Result<()>;

    /// Promote every draft of a step, returning how many changed.
    async fn promote_drafts_to_final(
        &self,
        user_id: &str,
        conversation_id: &str,
        step_id: &str,
    ) -> Result<usize>;

    async fn find_max_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        step_id: &str,
    ) -> Result<Option<u32>>;

    /// Last `limit` messages of a conversation, oldest first.
    async fn recent(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryMessage>>;
}

/// Process-local [`MemoryStore`] kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    messages: RwLock<Vec<MemoryMessage>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message of a step, ordered by seq.
    pub async fn step_messages(&self, step_id: &str) -> Vec<MemoryMessage> {
        let mut found: Vec<MemoryMessage> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.step_id == step_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.seq);
        found
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn upsert_message(&self, message: MemoryMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        match messages.iter_mut().find(|m| m.same_slot(&message)) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        Ok(())
    }

    async fn promote_drafts_to_final(
        &self,
        user_id: &str,
        conversation_id: &str,
        step_id: &str,
    ) -> Result<usize> {
        let mut promoted = 0;
        for message in self.messages.write().await.iter_mut() {
            if message.user_id == user_id
                && message.conversation_id == conversation_id
                && message.step_id == step_id
                && message.state == MessageState::Draft
            {
                message.state = MessageState::Final;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn find_max_seq(
        &self,
        user_id: &str,
        conversation_id: &str,
        step_id: &str,
    ) -> Result<Option<u32>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| {
                m.user_id == user_id && m.conversation_id == conversation_id && m.step_id == step_id
            })
            .map(|m| m.seq)
            .max())
    }

    async fn recent(
        &self,
        user_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryMessage>> {
        let messages = self.messages.read().await;
        let matching: Vec<&MemoryMessage> = messages
            .iter()
            .filter(|m| m.user_id == user_id && m.conversation_id == conversation_id)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_replaces_same_slot() {
        let store = InMemoryMemoryStore::new();
        store
            .upsert_message(MemoryMessage::draft("u", "c", "s1", 1, "user", "hi"))
            .await
            .unwrap();
        store
            .upsert_message(MemoryMessage::draft("u", "c", "s1", 1, "user", "hi again"))
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.step_messages("s1").await[0].content, "hi again");
    }

    #[tokio::test]
    async fn test_max_seq_and_promotion() {
        let store = InMemoryMemoryStore::new();
        assert_eq!(store.find_max_seq("u", "c", "s1").await.unwrap(), None);
        store
            .upsert_message(MemoryMessage::draft("u", "c", "s1", 1, "user", "q"))
            .await
            .unwrap();
        store
            .upsert_message(
                MemoryMessage::draft("u", "c", "s1", 2, "tool", "{}")
                    .with_payload(json!({"tool_call_id": "a"})),
            )
            .await
            .unwrap();
        assert_eq!(store.find_max_seq("u", "c", "s1").await.unwrap(), Some(2));
        assert_eq!(store.promote_drafts_to_final("u", "c", "s1").await.unwrap(), 2);
        assert_eq!(store.promote_drafts_to_final("u", "c", "s1").await.unwrap(), 0);
        assert!(store
            .step_messages("s1")
            .await
            .iter()
            .all(|m| m.state == MessageState::Final));
    }

    #[tokio::test]
    async fn test_recent_keeps_tail_in_order() {
        let store = InMemoryMemoryStore::new();
        for seq in 1..=5 {
            store
                .upsert_message(MemoryMessage::draft("u", "c", "s1", seq, "user", seq.to_string()))
                .await
                .unwrap();
        }
        store
            .upsert_message(MemoryMessage::draft("u", "other", "s2", 1, "user", "x"))
            .await
            .unwrap();
        let tail: Vec<_> = store
            .recent("u", "c", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(tail, vec!["4", "5"]);
    }
}
