//! Postgres-backed conversation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_conversation::{Conversation, ConversationStore, Message, MessageRole, StoreError};
use parley_core::{ConversationId, MessageId};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use tracing::instrument;

/// Row type for conversation queries.
#[derive(FromRow)]
struct ConversationRow {
    id: String,
    title: Option<String>,
    created_at: DateTime<Utc>,
}

impl ConversationRow {
    fn try_into_record(self) -> Result<Conversation, sqlx::Error> {
        let id = ConversationId::from_str(&self.id).map_err(|e| {
            decode_error(format!("invalid conversation id '{}': {}", self.id, e))
        })?;

        Ok(Conversation {
            id,
            title: self.title,
            created_at: self.created_at,
        })
    }
}

/// Row type for message queries.
#[derive(FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
    finalized_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    fn try_into_record(self) -> Result<Message, sqlx::Error> {
        let id = MessageId::from_str(&self.id)
            .map_err(|e| decode_error(format!("invalid message id '{}': {}", self.id, e)))?;
        let conversation_id = ConversationId::from_str(&self.conversation_id).map_err(|e| {
            decode_error(format!(
                "invalid conversation id '{}': {}",
                self.conversation_id, e
            ))
        })?;
        let role = MessageRole::from_str(&self.role).map_err(decode_error)?;

        Ok(Message {
            id,
            conversation_id,
            role,
            content: self.content,
            created_at: self.created_at,
            finalized_at: self.finalized_at,
        })
    }
}

fn decode_error(details: String) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        details,
    )))
}

fn database_error(e: sqlx::Error) -> StoreError {
    StoreError::Database {
        reason: e.to_string(),
    }
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, created_at, finalized_at";

/// Conversation store backed by Postgres.
#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, sqlx::Error> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MessageRow::try_into_record).transpose()
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    #[instrument(skip(self))]
    async fn create_conversation(&self) -> Result<Conversation, StoreError> {
        let conversation = Conversation::new();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, created_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.title.as_deref())
        .bind(conversation.created_at)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, title, created_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        row.ok_or(StoreError::ConversationNotFound { id })?
            .try_into_record()
            .map_err(database_error)
    }

    #[instrument(skip(self, title), fields(conversation_id = %id))]
    async fn set_title(&self, id: ConversationId, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET title = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(title)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound { id });
        }
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            r#"
            SELECT id, title, created_at
            FROM conversations
            ORDER BY seq DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.into_iter()
            .map(|r| r.try_into_record().map_err(database_error))
            .collect()
    }

    #[instrument(skip(self, content), fields(conversation_id = %conversation_id, role = %role))]
    async fn create_message(
        &self,
        conversation_id: ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let message = Message::new(conversation_id, role, content);
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, finalized_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .bind(message.finalized_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let orphan = e
                .as_database_error()
                .is_some_and(|db| db.is_foreign_key_violation());
            if orphan {
                StoreError::ConversationNotFound {
                    id: conversation_id,
                }
            } else {
                database_error(e)
            }
        })?;

        Ok(message)
    }

    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = $2
            WHERE id = $1 AND finalized_at IS NULL
            "#,
        )
        .bind(id.to_string())
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(database_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.find_message(id).await.map_err(database_error)? {
            Some(_) => Err(StoreError::MessageFinalized { id }),
            None => Err(StoreError::MessageNotFound { id }),
        }
    }

    #[instrument(skip(self, content), fields(message_id = %id))]
    async fn finalize_message(&self, id: MessageId, content: &str) -> Result<Message, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            r#"
            UPDATE messages
            SET content = $2, finalized_at = NOW()
            WHERE id = $1 AND finalized_at IS NULL
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(id.to_string())
        .bind(content)
        .fetch_optional(&self.pool)
        .await
        .map_err(database_error)?;

        if let Some(row) = row {
            return row.try_into_record().map_err(database_error);
        }
        match self.find_message(id).await.map_err(database_error)? {
            Some(existing) if existing.content == content => Ok(existing),
            Some(_) => Err(StoreError::MessageFinalized { id }),
            None => Err(StoreError::MessageNotFound { id }),
        }
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        self.get_conversation(conversation_id).await?;

        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#
        ))
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(database_error)?;

        rows.into_iter()
            .map(|r| r.try_into_record().map_err(database_error))
            .collect()
    }
}
