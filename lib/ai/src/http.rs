//! OpenAI-compatible streaming chat-completions client.
//!
//! Requests are sent with `stream: true`; the response is a server-sent
//! event body whose `data:` lines carry one completion chunk each and end
//! with `data: [DONE]`. Text deltas are emitted as soon as they arrive. Tool
//! call deltas arrive in pieces keyed by index and are assembled until the
//! choice reports a `finish_reason` (or the body ends).

use crate::backend::{
    ChatTurn, Fragment, FragmentStream, ModelClient, ModelRequest, ToolCall, TurnRole,
};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::stream::with_fragment_timeout;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parley_core::LineDecoder;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use tracing::{debug, instrument, warn};

const MAX_ERROR_DETAIL_CHARS: usize = 512;

/// Streaming model client for OpenAI-compatible endpoints.
pub struct HttpModelClient {
    client: reqwest::Client,
    config: ModelConfig,
    endpoint: String,
}

impl HttpModelClient {
    /// Creates a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ModelError::InvalidConfig {
                reason: e.to_string(),
            })?;
        let endpoint = format!("{}/chat/completions", config.base_url());

        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn build_body(&self, request: &ModelRequest) -> JsonValue {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.turns.iter().map(turn_to_message));

        let mut body = json!({
            "model": self.config.model_id,
            "messages": messages,
            "stream": true,
        });

        if !request.tools.is_empty() {
            let tools: Vec<JsonValue> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = JsonValue::Array(tools);
        }
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }

    /// One attempt at opening the stream.
    async fn open(&self, body: &JsonValue) -> Result<reqwest::Response, ModelError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match tokio::time::timeout(self.config.fragment_timeout(), builder.send())
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify_send_error(&e)),
            Err(_) => {
                return Err(ModelError::Unavailable {
                    status: None,
                    reason: "timed out waiting for response headers".to_string(),
                    retryable: true,
                });
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let detail = response.text().await.unwrap_or_default();
        Err(ModelError::Unavailable {
            status: Some(status.as_u16()),
            reason: detail.chars().take(MAX_ERROR_DETAIL_CHARS).collect(),
            retryable: status.is_server_error(),
        })
    }

    async fn open_with_retry(&self, body: &JsonValue) -> Result<reqwest::Response, ModelError> {
        let mut attempt = 0;
        loop {
            match self.open(body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "model request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    #[instrument(skip(self, request), fields(model = %self.config.model_id, turns = request.turns.len()))]
    async fn stream(&self, request: &ModelRequest) -> Result<FragmentStream, ModelError> {
        let body = self.build_body(request);
        let response = self.open_with_retry(&body).await?;
        debug!(status = %response.status(), "model stream opened");

        Ok(with_fragment_timeout(
            sse_fragments(response.bytes_stream()),
            self.config.fragment_timeout(),
        ))
    }

    fn model(&self) -> &str {
        &self.config.model_id
    }
}

fn turn_to_message(turn: &ChatTurn) -> JsonValue {
    match (turn.role, &turn.tool_call) {
        (TurnRole::Assistant, Some(call)) => json!({
            "role": "assistant",
            "content": if turn.content.is_empty() { JsonValue::Null } else { json!(turn.content) },
            "tool_calls": [{
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                }
            }],
        }),
        (TurnRole::Tool, _) => json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id.as_deref().unwrap_or_default(),
            "content": turn.content,
        }),
        (role, _) => json!({"role": role, "content": turn.content}),
    }
}

fn classify_send_error(e: &reqwest::Error) -> ModelError {
    ModelError::Unavailable {
        status: e.status().map(|s| s.as_u16()),
        reason: e.to_string(),
        retryable: e.is_timeout() || e.is_connect(),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl PartialCall {
    fn into_tool_call(self) -> ToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.arguments).unwrap_or_else(|e| {
                warn!(tool = %self.name, error = %e, "tool call arguments are not valid JSON");
                JsonValue::String(self.arguments.clone())
            })
        };
        ToolCall::new(self.id, self.name, arguments)
    }
}

/// Turns SSE lines into fragments.
#[derive(Debug, Default)]
struct ChunkParser {
    pending: VecDeque<Fragment>,
    calls: BTreeMap<u32, PartialCall>,
    done: bool,
}

impl ChunkParser {
    fn feed_line(&mut self, line: &str) -> Result<(), ModelError> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.finish();
            return Ok(());
        }

        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "skipping malformed completion chunk");
                return Ok(());
            }
        };

        if let Some(error) = chunk.error {
            return Err(ModelError::Unavailable {
                status: None,
                reason: error.message,
                retryable: false,
            });
        }

        for choice in chunk.choices {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    self.pending.push_back(Fragment::Text { content });
                }
                for call in delta.tool_calls.unwrap_or_default() {
                    let partial = self.calls.entry(call.index).or_default();
                    if let Some(id) = call.id {
                        partial.id = id;
                    }
                    if let Some(function) = call.function {
                        if let Some(name) = function.name {
                            partial.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            partial.arguments.push_str(&arguments);
                        }
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.flush_calls();
            }
        }

        Ok(())
    }

    fn flush_calls(&mut self) {
        let calls = std::mem::take(&mut self.calls);
        self.pending.extend(
            calls
                .into_values()
                .map(|call| Fragment::ToolCall(call.into_tool_call())),
        );
    }

    fn finish(&mut self) {
        self.flush_calls();
        self.done = true;
    }

    fn next_fragment(&mut self) -> Option<Fragment> {
        self.pending.pop_front()
    }
}

struct SseReader<S> {
    body: Pin<Box<S>>,
    decoder: LineDecoder,
    parser: ChunkParser,
    body_done: bool,
}

/// Adapts an SSE response body into fragments.
fn sse_fragments<S, B, E>(body: S) -> impl Stream<Item = Result<Fragment, ModelError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let reader = SseReader {
        body: Box::pin(body),
        decoder: LineDecoder::new(),
        parser: ChunkParser::default(),
        body_done: false,
    };

    futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        loop {
            if let Some(fragment) = reader.parser.next_fragment() {
                return Some((Ok(fragment), Some(reader)));
            }
            if reader.parser.done {
                return None;
            }
            if let Some(line) = reader.decoder.next_line() {
                if let Err(e) = reader.parser.feed_line(&line) {
                    return Some((Err(e), None));
                }
                continue;
            }
            if reader.body_done {
                if let Some(line) = reader.decoder.finish() {
                    if let Err(e) = reader.parser.feed_line(&line) {
                        return Some((Err(e), None));
                    }
                }
                reader.parser.finish();
                continue;
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.decoder.push(chunk.as_ref()),
                Some(Err(e)) => {
                    return Some((
                        Err(ModelError::Unavailable {
                            status: None,
                            reason: format!("response body interrupted: {e}"),
                            retryable: false,
                        }),
                        None,
                    ));
                }
                None => reader.body_done = true,
            }
        }
    })
}
