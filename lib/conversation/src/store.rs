//! Persistence contract for conversations and messages.

use crate::error::StoreError;
use crate::message::{Conversation, Message, MessageRole};
use async_trait::async_trait;
use parley_core::{ConversationId, MessageId};

/// Durable storage for conversations and their messages.
///
/// Every operation is atomic with respect to a single record. Writes that
/// reference a missing conversation or message are rejected rather than
/// creating orphans.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates an untitled conversation.
    async fn create_conversation(&self) -> Result<Conversation, StoreError>;

    /// Gets a conversation by ID.
    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError>;

    /// Replaces the conversation title.
    async fn set_title(&self, id: ConversationId, title: &str) -> Result<(), StoreError>;

    /// Lists conversations, most recent first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;

    /// Appends a message to a conversation.
    ///
    /// Assistant messages are created open; user and tool messages are
    /// created finalized.
    async fn create_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Replaces the content of an open message. Last write wins.
    async fn update_message_content(&self, id: MessageId, content: &str)
    -> Result<(), StoreError>;

    /// Sets the final content and stamps `finalized_at`.
    ///
    /// Finalizing an already finalized message with the same content returns
    /// it unchanged; different content is rejected with
    /// [`StoreError::MessageFinalized`].
    async fn finalize_message(&self, id: MessageId, content: &str) -> Result<Message, StoreError>;

    /// Lists the messages of a conversation in insertion order.
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError>;
}
