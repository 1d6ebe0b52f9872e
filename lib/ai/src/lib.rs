//! Language-model client adapter.
//!
//! Translates an ordered list of conversation turns into a streaming
//! chat-completions request and translates the response back into a lazy,
//! single-pass sequence of [`Fragment`]s.
//!
//! - **backend**: the [`ModelClient`] trait and the request/fragment types
//! - **config**: endpoint, credentials, timeouts and retry policy
//! - **http**: [`HttpModelClient`], the OpenAI-compatible streaming client
//! - **stream**: per-fragment timeout enforcement

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod stream;

pub use backend::{
    ChatTurn, Fragment, FragmentStream, ModelClient, ModelReply, ModelRequest, ToolCall, ToolSpec,
    TurnRole,
};
pub use config::ModelConfig;
pub use error::ModelError;
pub use http::HttpModelClient;
pub use stream::with_fragment_timeout;
