//! Database repositories for the parley server.
//!
//! This module provides Postgres storage for conversations and messages.

pub mod conversation;

pub use conversation::PgConversationStore;
