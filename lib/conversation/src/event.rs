//! Output events of a generation.
//!
//! Every event carries the full text accumulated so far, not the delta.
//! The last event of a stream is terminal: `done` on success, `error` on
//! failure. A stream whose caller went away ends without a terminal event.

use crate::error::ChatError;
use parley_core::MessageId;
use serde::{Deserialize, Serialize};

/// Role label the display surface expects on every event.
pub const EVENT_ROLE: &str = "ai";

/// A content block of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text { content: String },
}

/// Failure carried by a terminal error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFailure {
    /// Stable error kind, e.g. `ModelTimeoutError`.
    pub kind: String,
    pub message: String,
}

impl From<&ChatError> for StreamFailure {
    fn from(e: &ChatError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

/// One record of the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// The assistant message being generated.
    pub message_id: MessageId,
    pub role: String,
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamFailure>,
}

impl ChatEvent {
    /// An intermediate event.
    #[must_use]
    pub fn partial(message_id: MessageId, content: impl Into<String>) -> Self {
        Self {
            message_id,
            role: EVENT_ROLE.to_string(),
            blocks: vec![Block::Text {
                content: content.into(),
            }],
            done: false,
            error: None,
        }
    }

    /// The terminal event of a successful generation.
    #[must_use]
    pub fn completed(message_id: MessageId, content: impl Into<String>) -> Self {
        Self {
            done: true,
            ..Self::partial(message_id, content)
        }
    }

    /// The terminal event of a failed generation, with the partial content.
    #[must_use]
    pub fn failed(message_id: MessageId, content: impl Into<String>, error: &ChatError) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::partial(message_id, content)
        }
    }

    /// The cumulative text carried by this event.
    #[must_use]
    pub fn text(&self) -> &str {
        self.blocks
            .iter()
            .map(|Block::Text { content }| content.as_str())
            .next()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}
