//! MCP client over streamable HTTP.
//!
//! Every request is a JSON-RPC 2.0 message POSTed to `{url}/mcp/`. The
//! server answers either with a plain JSON body or with an event stream
//! whose `data:` lines carry notifications and, eventually, the response
//! to our request id. The session id handed out on `initialize` is echoed
//! on every later request; a 404 for a known session means it expired and
//! the client initializes again once.

use crate::config::McpConfig;
use crate::error::McpError;
use async_trait::async_trait;
use parley_ai::{ToolCall, ToolSpec};
use parley_conversation::{ToolError, ToolGateway};
use parley_core::LineDecoder;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

/// Protocol revision announced on `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Default)]
struct Session {
    initialized: bool,
    id: Option<String>,
}

struct Reply {
    result: JsonValue,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcMessage {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
}

impl RpcMessage {
    fn into_result(self) -> Result<JsonValue, McpError> {
        match self.error {
            Some(e) => Err(McpError::Rpc {
                code: e.code,
                message: e.message,
            }),
            None => Ok(self.result.unwrap_or(JsonValue::Null)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolsList {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<JsonValue>,
}

impl McpTool {
    fn into_spec(self) -> ToolSpec {
        ToolSpec {
            name: self.name,
            description: self.description.unwrap_or_default(),
            input_schema: self
                .input_schema
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<JsonValue>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    structured_content: Option<JsonValue>,
}

impl CallToolResult {
    /// Text items verbatim, anything else as JSON, one per line.
    fn render(&self) -> String {
        let rendered: Vec<String> = self
            .content
            .iter()
            .map(|item| match (item["type"].as_str(), item["text"].as_str()) {
                (Some("text"), Some(text)) => text.to_string(),
                _ => item.to_string(),
            })
            .collect();

        match (&self.structured_content, rendered.is_empty()) {
            (Some(structured), true) => structured.to_string(),
            _ => rendered.join("\n"),
        }
    }
}

/// Tool gateway backed by an MCP server.
pub struct McpToolGateway {
    client: reqwest::Client,
    endpoint: String,
    session: Mutex<Session>,
}

impl McpToolGateway {
    /// Creates a gateway. No request is made until the first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &McpConfig) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            session: Mutex::new(Session::default()),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Performs the `initialize` handshake unless it already succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or rejects the handshake.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn initialize(&self) -> Result<(), McpError> {
        let mut session = self.session.lock().await;
        if session.initialized {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": true}},
            "clientInfo": {"name": "parley", "version": env!("CARGO_PKG_VERSION")},
        });
        let reply = self.exchange("initialize", params, None).await?;
        session.id = reply.session_id;

        info!(
            server = reply.result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            protocol_version = reply.result["protocolVersion"].as_str().unwrap_or("unknown"),
            session = session.id.as_deref().unwrap_or("none"),
            "MCP session initialized"
        );

        if let Err(e) = self
            .notify("notifications/initialized", session.id.as_deref())
            .await
        {
            warn!(error = %e, "failed to acknowledge MCP initialization");
        }
        session.initialized = true;
        Ok(())
    }

    async fn request(&self, method: &str, params: JsonValue) -> Result<JsonValue, McpError> {
        self.initialize().await?;
        let session_id = self.session.lock().await.id.clone();

        let reply = match self
            .exchange(method, params.clone(), session_id.as_deref())
            .await
        {
            Err(McpError::Http { status: 404, .. }) if session_id.is_some() => {
                warn!(method, "MCP session expired, initializing again");
                self.session.lock().await.initialized = false;
                self.initialize().await?;
                let session_id = self.session.lock().await.id.clone();
                self.exchange(method, params, session_id.as_deref()).await?
            }
            other => other?,
        };

        if let Some(id) = reply.session_id {
            self.session.lock().await.id = Some(id);
        }
        Ok(reply.result)
    }

    async fn exchange(
        &self,
        method: &str,
        params: JsonValue,
        session_id: Option<&str>,
    ) -> Result<Reply, McpError> {
        let request_id = Ulid::new().to_string();
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });

        let response = self.post(&body, session_id).await?;
        let session_id = header_value(&response, SESSION_HEADER);
        let is_event_stream = header_value(&response, CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let text = response.text().await?;

        let message = if is_event_stream {
            find_response(&text, &request_id)?
        } else {
            serde_json::from_str(&text).map_err(|e| McpError::Protocol {
                reason: format!("invalid JSON-RPC response: {e}"),
            })?
        };

        Ok(Reply {
            result: message.into_result()?,
            session_id,
        })
    }

    async fn notify(&self, method: &str, session_id: Option<&str>) -> Result<(), McpError> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        self.post(&body, session_id).await?;
        Ok(())
    }

    async fn post(
        &self,
        body: &JsonValue,
        session_id: Option<&str>,
    ) -> Result<reqwest::Response, McpError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(id) = session_id {
            builder = builder.header(SESSION_HEADER, id);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(McpError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ToolGateway for McpToolGateway {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        let listed: ToolsList = serde_json::from_value(result).map_err(|e| McpError::Protocol {
            reason: format!("invalid tools/list result: {e}"),
        })?;

        let tools: Vec<ToolSpec> = listed.tools.into_iter().map(McpTool::into_spec).collect();
        info!(count = tools.len(), "discovered MCP tools");
        Ok(tools)
    }

    #[instrument(skip(self, call), fields(tool = %call.name, call_id = %call.id))]
    async fn call_tool(&self, call: &ToolCall) -> Result<String, ToolError> {
        let params = json!({"name": call.name, "arguments": call.arguments});
        let result = match self.request("tools/call", params).await {
            Ok(result) => result,
            Err(McpError::Rpc { message, .. }) => {
                return Err(ToolError::ExecutionFailed {
                    name: call.name.clone(),
                    reason: message,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result: CallToolResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol {
                reason: format!("invalid tools/call result: {e}"),
            })?;
        let output = result.render();
        if result.is_error {
            return Err(ToolError::ExecutionFailed {
                name: call.name.clone(),
                reason: output,
            });
        }

        debug!(bytes = output.len(), "tool call succeeded");
        Ok(output)
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Picks the response to `request_id` out of an event stream body.
fn find_response(body: &str, request_id: &str) -> Result<RpcMessage, McpError> {
    let mut decoder = LineDecoder::new();
    decoder.push(body.as_bytes());

    while let Some(line) = decoder.next_line().or_else(|| decoder.finish()) {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let message: RpcMessage = match serde_json::from_str(data.trim()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "skipping malformed MCP event");
                continue;
            }
        };

        match (&message.id, &message.method) {
            (None, Some(method)) => debug!(method, "MCP notification"),
            (Some(JsonValue::String(id)), _) if id == request_id => return Ok(message),
            _ => {}
        }
    }

    Err(McpError::NoResponse {
        request_id: request_id.to_string(),
    })
}
