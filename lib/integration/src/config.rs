//! MCP client configuration.

use serde::Deserialize;
use std::time::Duration;

/// Where the tool server lives. Loaded from `TOOLS__*`.
#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    /// Server root, e.g. `http://localhost:8001`. Requests go to `{url}/mcp/`.
    pub url: String,

    /// Upper bound for a whole request, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl McpConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// The JSON-RPC endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/mcp/", self.url.trim_end_matches('/'))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalizes_trailing_slash() {
        assert_eq!(
            McpConfig::new("http://localhost:8001/").endpoint(),
            "http://localhost:8001/mcp/"
        );
        assert_eq!(McpConfig::new("http://tools").timeout_secs, 30);
    }
}
