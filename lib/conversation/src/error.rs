//! Error types for the conversation crate.
//!
//! - `StoreError`: errors from persistence operations
//! - `ToolError`: errors from the tool gateway
//! - `ChatError`: errors from handling a user message, with a stable kind

use parley_ai::ModelError;
use parley_core::{ConversationId, MessageId};
use std::fmt;

/// Errors from persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The conversation does not exist.
    ConversationNotFound { id: ConversationId },
    /// The message does not exist.
    MessageNotFound { id: MessageId },
    /// The message was finalized and no longer accepts content changes.
    MessageFinalized { id: MessageId },
    /// The backing database failed.
    Database { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConversationNotFound { id } => write!(f, "conversation not found: {id}"),
            Self::MessageNotFound { id } => write!(f, "message not found: {id}"),
            Self::MessageFinalized { id } => write!(f, "message already finalized: {id}"),
            Self::Database { reason } => write!(f, "database operation failed: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The tool server does not know the tool.
    NotFound { name: String },
    /// The tool ran and reported a failure.
    ExecutionFailed { name: String, reason: String },
    /// The tool server could not be reached.
    Unavailable { reason: String },
    /// The tool server answered with something unexpected.
    Protocol { reason: String },
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "tool not found: {name}"),
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
            Self::Unavailable { reason } => write!(f, "tool server unavailable: {reason}"),
            Self::Protocol { reason } => write!(f, "tool protocol error: {reason}"),
        }
    }
}

impl std::error::Error for ToolError {}

/// Errors from handling a user message.
///
/// The first three are raised before any output is produced; the rest end a
/// stream that has already started.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatError {
    /// The message text is empty.
    Validation { reason: String },
    /// The conversation does not exist.
    NotFound { id: ConversationId },
    /// Another generation is in flight for the conversation.
    ConversationBusy { id: ConversationId },
    /// The model could not be reached or stopped producing output.
    Model(ModelError),
    /// Tool calls failed too often, or no tool gateway is configured.
    ToolInvocation { reason: String },
    /// The store failed.
    Persistence(StoreError),
}

impl ChatError {
    /// Stable kind reported to callers in error events and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::ConversationBusy { .. } => "ConversationBusyError",
            Self::Model(e) => e.kind(),
            Self::ToolInvocation { .. } => "ToolInvocationError",
            Self::Persistence(_) => "PersistenceError",
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "invalid message: {reason}"),
            Self::NotFound { id } => write!(f, "conversation not found: {id}"),
            Self::ConversationBusy { id } => {
                write!(f, "conversation {id} already has a response in progress")
            }
            Self::Model(e) => e.fmt(f),
            Self::ToolInvocation { reason } => write!(f, "tool invocation failed: {reason}"),
            Self::Persistence(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ChatError {}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound { id } => Self::NotFound { id },
            other => Self::Persistence(other),
        }
    }
}

impl From<ModelError> for ChatError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let id = ConversationId::new();
        assert_eq!(
            ChatError::Validation {
                reason: "empty".to_string()
            }
            .kind(),
            "ValidationError"
        );
        assert_eq!(ChatError::ConversationBusy { id }.kind(), "ConversationBusyError");
        assert_eq!(
            ChatError::from(ModelError::Timeout { waited_ms: 5 }).kind(),
            "ModelTimeoutError"
        );
        assert_eq!(
            ChatError::from(StoreError::Database {
                reason: "gone".to_string()
            })
            .kind(),
            "PersistenceError"
        );
    }

    #[test]
    fn missing_conversation_maps_to_not_found() {
        let id = ConversationId::new();
        let err = ChatError::from(StoreError::ConversationNotFound { id });
        assert_eq!(err, ChatError::NotFound { id });
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::ExecutionFailed {
            name: "search_wikipedia".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(err.to_string().contains("search_wikipedia"));
        assert!(err.to_string().contains("timeout"));
    }
}
