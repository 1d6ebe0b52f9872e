//! HTTP handlers.
//!
//! Record endpoints answer with the JSON [`Envelope`]; `/chat` answers with
//! one [`ChatEvent`](parley_conversation::ChatEvent) per line.

use crate::app::{AppState, X_CONVERSATION_ID};
use crate::envelope::Envelope;
use crate::error::ApiError;
use axum::{
    Json,
    body::Body,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, future};
use parley_conversation::{Conversation, Message};
use parley_core::{ConversationId, encode_line};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Content type of the chat stream.
pub const NDJSON: &str = "application/x-ndjson";

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub model: String,
    pub tools_configured: bool,
}

fn parse_conversation_id(raw: &str) -> Result<ConversationId, ApiError> {
    ConversationId::from_str(raw).map_err(|e| ApiError::InvalidId {
        id: raw.to_string(),
        details: e.to_string(),
    })
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state.store.create_conversation().await?;
    info!(conversation_id = %conversation.id, "created conversation");
    Ok((StatusCode::CREATED, Json(Envelope::ok(conversation))))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Envelope<Vec<Conversation>>>, ApiError> {
    let conversations = state.store.list_conversations().await?;
    Ok(Json(Envelope::ok(conversations)))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Conversation>>, ApiError> {
    let id = parse_conversation_id(&id)?;
    let conversation = state.store.get_conversation(id).await?;
    Ok(Json(Envelope::ok(conversation)))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Vec<Message>>>, ApiError> {
    let id = parse_conversation_id(&id)?;
    let messages = state.store.list_messages(id).await?;
    Ok(Json(Envelope::ok(messages)))
}

/// Sends a user message and streams the assistant response.
///
/// Failures before generation starts are answered with the error envelope.
/// Once streaming, failures arrive as the terminal event.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::InvalidRequest {
        details: e.body_text(),
    })?;
    let conversation_id = request
        .conversation_id
        .as_deref()
        .map(parse_conversation_id)
        .transpose()?;

    let stream = state
        .chat
        .handle_user_message(conversation_id, &request.content)
        .await?;
    let conversation_id = stream.conversation_id();

    let lines = stream.filter_map(|event| {
        future::ready(match encode_line(&event) {
            Ok(line) => Some(Ok::<_, Infallible>(line)),
            Err(e) => {
                warn!(error = %e, message_id = %event.message_id, "dropping unencodable event");
                None
            }
        })
    });

    let mut response = Body::from_stream(lines).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    if let Ok(value) = HeaderValue::from_str(&conversation_id.to_string()) {
        headers.insert(X_CONVERSATION_ID, value);
    }
    Ok(response)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Envelope<Health>> {
    Json(Envelope::ok(Health {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.chat.model().to_string(),
        tools_configured: state.chat.has_tools(),
    }))
}
