//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested
//! sections use `__` as separator, e.g. `MODEL__MODEL_ID` or `TOOLS__URL`.
//!
//! See [`ModelConfig`], [`McpConfig`] and [`ChatConfig`] for the library
//! sections.

use parley_ai::ModelConfig;
use parley_conversation::ChatConfig;
use parley_integration::McpConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL connection URL. Conversations are kept in memory when unset.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Comma separated origins allowed by CORS.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: String,

    #[serde(default)]
    pub log: LogConfig,

    /// Model endpoint configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// MCP tool server. Tools are disabled when unset.
    #[serde(default)]
    pub tools: Option<McpConfig>,

    /// Prompt and generation limits.
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_cors_origins() -> String {
    "http://localhost:5173".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(environment.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// The configured CORS origins, blanks removed.
    #[must_use]
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let source = vars
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        ServerConfig::from_source(config::Environment::default().source(Some(source)))
            .expect("config")
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]);

        assert_eq!(config.database_url, None);
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.cors_origins(), vec!["http://localhost:5173"]);
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.model.region, "us-east-1");
        assert!(config.tools.is_none());
        assert_eq!(config.chat.max_tool_rounds, 8);
        assert_eq!(config.chat.channel_capacity, 16);
    }

    #[test]
    fn nested_sections_use_double_underscore() {
        let config = load(&[
            ("database_url", "postgres://localhost/parley"),
            ("log__format", "json"),
            ("model__model_id", "gpt-4o-mini"),
            ("model__fragment_timeout_ms", "5000"),
            ("tools__url", "http://localhost:8001"),
            ("chat__max_tool_failures", "1"),
        ]);

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/parley")
        );
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.model.model_id, "gpt-4o-mini");
        assert_eq!(config.model.fragment_timeout_ms, 5000);
        let tools = config.tools.expect("tools");
        assert_eq!(tools.url, "http://localhost:8001");
        assert_eq!(tools.timeout_secs, 30);
        assert_eq!(config.chat.max_tool_failures, 1);
    }

    #[test]
    fn cors_origins_split_on_commas() {
        let config = load(&[(
            "cors_origins",
            "http://localhost:5173, https://chat.example.com,",
        )]);

        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:5173", "https://chat.example.com"]
        );
    }
}
