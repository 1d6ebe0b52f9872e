//! Model client configuration.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Configuration for [`HttpModelClient`](crate::HttpModelClient).
///
/// Loaded from the `MODEL__*` environment variables by the server.
#[derive(Clone, Deserialize)]
pub struct ModelConfig {
    /// Region of the hosted inference service.
    #[serde(default = "default_region")]
    pub region: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Overrides the endpoint derived from the region.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token, when the endpoint requires one.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Upper bound for establishing a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for the wait between two fragments (and for the response
    /// headers).
    #[serde(default = "default_fragment_timeout_ms")]
    pub fragment_timeout_ms: u64,

    /// Additional attempts for retryable failures while opening a stream.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_model_id() -> String {
    "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_fragment_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    4_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            model_id: default_model_id(),
            base_url: None,
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            fragment_timeout_ms: default_fragment_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl ModelConfig {
    /// Creates a configuration pointing at an explicit endpoint.
    #[must_use]
    pub fn for_endpoint(base_url: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    /// Endpoint root, without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://bedrock-runtime.{}.amazonaws.com/openai/v1",
                self.region
            ),
        }
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }

    /// Delay before retry number `attempt` (zero based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("region", &self.region)
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("fragment_timeout_ms", &self.fragment_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_follows_region() {
        let config = ModelConfig {
            region: "eu-west-1".to_string(),
            ..ModelConfig::default()
        };
        assert_eq!(
            config.base_url(),
            "https://bedrock-runtime.eu-west-1.amazonaws.com/openai/v1"
        );

        let config = ModelConfig::for_endpoint("http://localhost:9000/v1/", "test");
        assert_eq!(config.base_url(), "http://localhost:9000/v1");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ModelConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(250));
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(4), Duration::from_millis(4_000));
        assert_eq!(config.backoff(70), Duration::from_millis(4_000));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = ModelConfig {
            api_key: Some("sk-secret".to_string()),
            ..ModelConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
