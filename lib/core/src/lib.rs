//! Core types shared by every parley crate.
//!
//! - **id**: ULID-backed identifiers for conversations, messages and stream sessions
//! - **error**: the rootcause `Result` alias used on the startup path
//! - **ndjson**: newline-delimited JSON framing (encoder and line-buffering decoder)

pub mod error;
pub mod id;
pub mod ndjson;

pub use error::Result;
pub use id::{ConversationId, MessageId, ParseIdError, StreamSessionId};
pub use ndjson::{DecoderState, FrameError, LineDecoder, decode_stream, encode_line};
