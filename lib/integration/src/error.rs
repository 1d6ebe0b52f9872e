//! Error types for the integration crate.

use parley_conversation::ToolError;
use std::fmt;

/// Errors from talking to an MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpError {
    /// The request could not be sent or the response could not be read.
    Transport { reason: String },
    /// The server did not answer in time.
    Timeout,
    /// The server answered with a non-success HTTP status.
    Http { status: u16, body: String },
    /// The server answered with a JSON-RPC error.
    Rpc { code: i64, message: String },
    /// The response did not follow the protocol.
    Protocol { reason: String },
    /// An event stream ended without the response to our request.
    NoResponse { request_id: String },
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { reason } => write!(f, "MCP transport failed: {reason}"),
            Self::Timeout => write!(f, "MCP request timed out"),
            Self::Http { status, body } => write!(f, "MCP server returned HTTP {status}: {body}"),
            Self::Rpc { code, message } => write!(f, "MCP error {code}: {message}"),
            Self::Protocol { reason } => write!(f, "MCP protocol error: {reason}"),
            Self::NoResponse { request_id } => {
                write!(f, "no response for MCP request {request_id}")
            }
        }
    }
}

impl std::error::Error for McpError {}

impl From<reqwest::Error> for McpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport {
                reason: e.to_string(),
            }
        }
    }
}

impl From<McpError> for ToolError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::Transport { .. } | McpError::Timeout | McpError::Http { .. } => {
                Self::Unavailable {
                    reason: e.to_string(),
                }
            }
            McpError::Rpc { .. } | McpError::Protocol { .. } | McpError::NoResponse { .. } => {
                Self::Protocol {
                    reason: e.to_string(),
                }
            }
        }
    }
}
