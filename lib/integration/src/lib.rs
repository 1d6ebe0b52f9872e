//! Tool gateway for parley.
//!
//! This crate provides:
//!
//! - **MCP client**: [`McpToolGateway`], which reaches an external Model
//!   Context Protocol server over streamable HTTP (JSON-RPC 2.0) and exposes
//!   its tools through the conversation crate's `ToolGateway` contract
//! - **Configuration**: server URL and request timeout

pub mod config;
pub mod error;
pub mod mcp;

pub use config::McpConfig;
pub use error::McpError;
pub use mcp::McpToolGateway;
