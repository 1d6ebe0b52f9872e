//! Model client abstraction.
//!
//! Provides the interface the orchestrator talks to, independent of which
//! inference service sits behind it.

use crate::error::ModelError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::pin::Pin;

/// The role of a turn handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// Instructions for the model.
    System,
    /// Human input.
    User,
    /// Model output, or a tool call the model requested.
    Assistant,
    /// The result of a tool call.
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier assigned by the model, echoed back with the result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments, as a JSON object.
    pub arguments: JsonValue,
}

impl ToolCall {
    /// Creates a tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One entry of the conversation as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who produced the turn.
    pub role: TurnRole,
    /// Text content (empty for a bare tool call).
    pub content: String,
    /// Set on assistant turns that requested a tool.
    pub tool_call: Option<ToolCall>,
    /// Set on tool turns: the call this result answers.
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    fn plain(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call: None,
            tool_call_id: None,
        }
    }

    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::User, content)
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::Assistant, content)
    }

    /// An assistant turn requesting a tool, with any text produced before it.
    #[must_use]
    pub fn tool_request(content: impl Into<String>, call: ToolCall) -> Self {
        Self {
            tool_call: Some(call),
            ..Self::plain(TurnRole::Assistant, content)
        }
    }

    /// The result of a tool call.
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(TurnRole::Tool, content)
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// JSON schema of the arguments.
    pub input_schema: JsonValue,
}

/// A request to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// System prompt, if any.
    pub system: Option<String>,
    /// Ordered conversation turns, oldest first.
    pub turns: Vec<ChatTurn>,
    /// Tools offered to the model.
    pub tools: Vec<ToolSpec>,
}

impl ModelRequest {
    /// Creates a request from turns.
    #[must_use]
    pub fn new(turns: Vec<ChatTurn>) -> Self {
        Self {
            turns,
            ..Self::default()
        }
    }

    /// Adds a system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Offers tools to the model.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// One incremental unit of model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    /// A piece of text, to be appended to what came before.
    Text { content: String },
    /// The model wants a tool invoked before it continues.
    ToolCall(ToolCall),
}

impl Fragment {
    /// A text fragment.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }
}

/// A lazy, finite, single-pass sequence of fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, ModelError>> + Send>>;

/// A complete (non-incremental) model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    /// All text, concatenated.
    pub content: String,
    /// Tool calls, in the order they were requested.
    pub tool_calls: Vec<ToolCall>,
}

/// Trait for inference backends.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Starts a generation and returns its fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be reached or rejects the
    /// request. Errors after the stream is returned arrive as stream items.
    async fn stream(&self, request: &ModelRequest) -> Result<FragmentStream, ModelError>;

    /// Returns the model identifier.
    fn model(&self) -> &str;

    /// Runs a generation to completion and returns the whole response.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while opening or draining the stream.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, ModelError> {
        let mut fragments = self.stream(request).await?;
        let mut reply = ModelReply::default();

        while let Some(fragment) = fragments.next().await {
            match fragment? {
                Fragment::Text { content } => reply.content.push_str(&content),
                Fragment::ToolCall(call) => reply.tool_calls.push(call),
            }
        }

        Ok(reply)
    }
}
