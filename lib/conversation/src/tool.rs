//! Tool gateway contract.
//!
//! The model may ask for a tool mid-generation. The orchestrator forwards
//! the call through a [`ToolGateway`] and feeds the output back to the model
//! as an additional turn.

use crate::error::ToolError;
use async_trait::async_trait;
use parley_ai::{ToolCall, ToolSpec};

/// Access to externally hosted tools.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Lists the tools the model may call.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError>;

    /// Invokes a tool and returns its textual output.
    async fn call_tool(&self, call: &ToolCall) -> Result<String, ToolError>;
}
