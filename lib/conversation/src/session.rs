//! Stream sessions.
//!
//! A session is the transient state of one generation: the placeholder
//! message being filled, the text accumulated so far, and the turns handed
//! to the model (tool turns included, which are never persisted). It holds
//! the conversation's busy guard for its whole lifetime.

use crate::lock::BusyGuard;
use parley_ai::{ChatTurn, ToolCall};
use parley_core::{ConversationId, MessageId, StreamSessionId};

/// State of one in-flight generation.
#[derive(Debug)]
pub struct StreamSession {
    pub id: StreamSessionId,
    pub conversation_id: ConversationId,
    /// The placeholder assistant message.
    pub message_id: MessageId,
    accumulated: String,
    // Offset into `accumulated` where the current model invocation began.
    round_start: usize,
    turns: Vec<ChatTurn>,
    tool_rounds: u32,
    tool_failures: u32,
    _guard: BusyGuard,
}

impl StreamSession {
    /// Starts a session from the loaded history.
    #[must_use]
    pub fn new(guard: BusyGuard, message_id: MessageId, turns: Vec<ChatTurn>) -> Self {
        Self {
            id: StreamSessionId::new(),
            conversation_id: guard.conversation_id(),
            message_id,
            accumulated: String::new(),
            round_start: 0,
            turns,
            tool_rounds: 0,
            tool_failures: 0,
            _guard: guard,
        }
    }

    /// Appends a fragment and returns the cumulative text.
    pub fn append(&mut self, fragment: &str) -> &str {
        self.accumulated.push_str(fragment);
        &self.accumulated
    }

    /// Text accumulated so far.
    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Turns to hand to the model next.
    #[must_use]
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Records a tool round: the model's request and the tool's output.
    ///
    /// Text the model produced in the current invocation before asking is
    /// attached to the request turn so the model sees its own output again.
    pub fn record_tool_round(&mut self, call: ToolCall, output: String) -> u32 {
        let call_id = call.id.clone();
        let preamble = &self.accumulated[self.round_start..];
        self.turns.push(ChatTurn::tool_request(preamble, call));
        self.round_start = self.accumulated.len();
        self.turns.push(ChatTurn::tool_result(call_id, output));
        self.tool_rounds += 1;
        self.tool_rounds
    }

    /// Counts a failed tool call and returns the running total.
    pub fn record_tool_failure(&mut self) -> u32 {
        self.tool_failures += 1;
        self.tool_failures
    }

    #[must_use]
    pub fn tool_rounds(&self) -> u32 {
        self.tool_rounds
    }
}
