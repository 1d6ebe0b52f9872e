//! In-memory [`ConversationStore`].
//!
//! Used when no database is configured, and by tests.

use crate::error::StoreError;
use crate::message::{Conversation, Message, MessageRole};
use crate::store::ConversationStore;
use async_trait::async_trait;
use chrono::Utc;
use parley_core::{ConversationId, MessageId};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    created: Vec<ConversationId>,
    // Insertion order is chronological order.
    messages: Vec<Message>,
    positions: HashMap<MessageId, usize>,
}

impl State {
    fn message_mut(&mut self, id: MessageId) -> Result<&mut Message, StoreError> {
        let position = *self
            .positions
            .get(&id)
            .ok_or(StoreError::MessageNotFound { id })?;
        self.messages
            .get_mut(position)
            .ok_or(StoreError::MessageNotFound { id })
    }
}

/// Conversation store backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    state: RwLock<State>,
}

impl InMemoryConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(&self) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new();
        let mut state = self.state.write().await;
        state.created.push(conversation.id);
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        self.state
            .read()
            .await
            .conversations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ConversationNotFound { id })
    }

    async fn set_title(&self, id: ConversationId, title: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::ConversationNotFound { id })?;
        conversation.title = Some(title.to_string());
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .created
            .iter()
            .rev()
            .filter_map(|id| state.conversations.get(id).cloned())
            .collect())
    }

    async fn create_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound {
                id: conversation_id,
            });
        }

        let message = Message::new(conversation_id, role, content);
        let position = state.messages.len();
        state.positions.insert(message.id, position);
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let message = state.message_mut(id)?;
        if message.is_finalized() {
            return Err(StoreError::MessageFinalized { id });
        }
        content.clone_into(&mut message.content);
        Ok(())
    }

    async fn finalize_message(&self, id: MessageId, content: &str) -> Result<Message, StoreError> {
        let mut state = self.state.write().await;
        let message = state.message_mut(id)?;
        if message.is_finalized() {
            return if message.content == content {
                Ok(message.clone())
            } else {
                Err(StoreError::MessageFinalized { id })
            };
        }
        content.clone_into(&mut message.content);
        message.finalized_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read().await;
        if !state.conversations.contains_key(&conversation_id) {
            return Err(StoreError::ConversationNotFound {
                id: conversation_id,
            });
        }
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}
