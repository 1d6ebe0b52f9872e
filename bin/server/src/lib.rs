//! HTTP server for parley.
//!
//! Exposes conversations, their messages, and a streaming chat endpoint
//! backed by [`parley_conversation::ChatOrchestrator`].

pub mod app;
pub mod config;
pub mod db;
pub mod envelope;
pub mod error;
pub mod routes;
pub mod telemetry;
