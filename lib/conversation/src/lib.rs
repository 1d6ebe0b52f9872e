//! Conversation pipeline for parley.
//!
//! This crate provides:
//!
//! - **Store**: persistence contract for conversations and messages, with an
//!   in-memory implementation
//! - **Orchestrator**: turns a user message into a streamed, persisted
//!   assistant response
//! - **Tool Gateway**: contract for tools the model may call mid-generation
//! - **Events**: the records delivered to the caller

pub mod error;
pub mod event;
pub mod lock;
pub mod memory;
pub mod message;
pub mod orchestrator;
pub mod session;
pub mod store;
pub mod tool;

pub use error::{ChatError, StoreError, ToolError};
pub use event::{Block, ChatEvent, StreamFailure};
pub use lock::{BusyGuard, ConversationLocks};
pub use memory::InMemoryConversationStore;
pub use message::{Conversation, Message, MessageRole, derive_title};
pub use orchestrator::{ChatConfig, ChatOrchestrator, ChatStream};
pub use session::StreamSession;
pub use store::ConversationStore;
pub use tool::ToolGateway;
