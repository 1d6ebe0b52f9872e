//! Error types for the model client.

use std::fmt;

/// Errors from model client operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The inference service could not be reached or refused the request.
    Unavailable {
        /// HTTP status, when the service answered at all.
        status: Option<u16>,
        /// What went wrong.
        reason: String,
        /// Whether another attempt may succeed (timeouts, 5xx, connect errors).
        retryable: bool,
    },
    /// No fragment arrived within the configured wait.
    Timeout {
        /// How long the client waited.
        waited_ms: u64,
    },
    /// The client configuration is unusable.
    InvalidConfig { reason: String },
}

impl ModelError {
    /// Stable error kind reported to callers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } | Self::InvalidConfig { .. } => "ModelUnavailableError",
            Self::Timeout { .. } => "ModelTimeoutError",
        }
    }

    /// Whether the adapter may retry the request that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { retryable: true, .. })
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable {
                status: Some(status),
                reason,
                ..
            } => write!(f, "model service unavailable (HTTP {status}): {reason}"),
            Self::Unavailable {
                status: None,
                reason,
                ..
            } => write!(f, "model service unavailable: {reason}"),
            Self::Timeout { waited_ms } => {
                write!(f, "no output from model within {waited_ms}ms")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid model configuration: {reason}")
            }
        }
    }
}

impl std::error::Error for ModelError {}
