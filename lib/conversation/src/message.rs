//! Conversation and message records.

use chrono::{DateTime, Utc};
use parley_ai::{ChatTurn, TurnRole};
use parley_core::{ConversationId, MessageId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of characters kept when deriving a title.
pub const TITLE_MAX_CHARS: usize = 50;

/// The role of a message sender. Immutable once the message exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Human input.
    User,
    /// Model output.
    Assistant,
    /// Tool result.
    Tool,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Derived from the first user message.
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates an untitled conversation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ConversationId::new(),
            title: None,
            created_at: Utc::now(),
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// The conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    /// When the content became immutable. `None` while an assistant
    /// response is still being generated.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Creates a message. Assistant messages start open; all others are
    /// finalized on creation.
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content: content.into(),
            created_at: now,
            finalized_at: (role != MessageRole::Assistant).then_some(now),
        }
    }

    /// Returns true once the content can no longer change.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// The message as a model turn.
    #[must_use]
    pub fn to_turn(&self) -> ChatTurn {
        let role = match self.role {
            MessageRole::User => TurnRole::User,
            MessageRole::Assistant => TurnRole::Assistant,
            MessageRole::Tool => TurnRole::Tool,
        };
        ChatTurn {
            role,
            content: self.content.clone(),
            tool_call: None,
            tool_call_id: None,
        }
    }
}

/// Derives a conversation title from the first user message.
///
/// Whitespace runs collapse to a single space. Titles longer than
/// [`TITLE_MAX_CHARS`] characters are cut on a character boundary and end
/// with `...`. Returns `None` for blank text.
#[must_use]
pub fn derive_title(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return Some(collapsed);
    }

    let mut title: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    title.truncate(title.trim_end().len());
    title.push_str("...");
    Some(title)
}
