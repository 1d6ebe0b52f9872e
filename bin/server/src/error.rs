//! Domain error types for server operations.
//!
//! - `ApiError`: request failures, rendered as the JSON error envelope
//! - `StartupError`: failures while bringing the server up, carried in a
//!   rootcause report

use crate::envelope::Envelope;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use parley_conversation::{ChatError, StoreError};
use std::fmt;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The request body is not valid JSON for the endpoint.
    InvalidRequest { details: String },
    /// A path or body identifier could not be parsed.
    InvalidId { id: String, details: String },
    /// Handling a chat message failed before streaming started.
    Chat(ChatError),
    /// A read or write against the store failed.
    Store(StoreError),
}

impl ApiError {
    /// Stable code reported in the envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidId { .. } => "INVALID_ID",
            Self::Chat(ChatError::Validation { .. }) => "VALIDATION_ERROR",
            Self::Chat(ChatError::NotFound { .. })
            | Self::Store(StoreError::ConversationNotFound { .. })
            | Self::Store(StoreError::MessageNotFound { .. }) => "NOT_FOUND",
            Self::Chat(ChatError::ConversationBusy { .. }) => "CONVERSATION_BUSY",
            Self::Chat(ChatError::Persistence(_)) | Self::Store(_) => "STORAGE_ERROR",
            Self::Chat(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.code() {
            "INVALID_REQUEST" | "INVALID_ID" => StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR" => StatusCode::UNPROCESSABLE_ENTITY,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "CONVERSATION_BUSY" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest { details } => write!(f, "invalid request: {details}"),
            Self::InvalidId { id, details } => write!(f, "invalid id '{id}': {details}"),
            Self::Chat(e) => e.fmt(f),
            Self::Store(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self::Chat(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Store details stay in the log.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(Envelope::<()>::error(self.code(), message))).into_response()
    }
}

/// Errors raised while starting the server.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// Could not connect to the database.
    Database { details: String },
    /// Schema migrations failed.
    Migration { details: String },
    /// The model client could not be built.
    ModelClient { details: String },
    /// The tool gateway could not be built.
    ToolGateway { details: String },
    /// Could not bind the listener.
    Bind { addr: String, details: String },
    /// The server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::Database { details } => write!(f, "failed to connect to database: {details}"),
            Self::Migration { details } => write!(f, "failed to run migrations: {details}"),
            Self::ModelClient { details } => write!(f, "failed to build model client: {details}"),
            Self::ToolGateway { details } => {
                write!(f, "failed to build tool gateway: {details}")
            }
            Self::Bind { addr, details } => write!(f, "failed to bind to {addr}: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}
