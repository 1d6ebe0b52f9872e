//! Router assembly and shared state.

use crate::routes;
use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, header},
    routing::{get, post},
};
use parley_conversation::{ChatOrchestrator, ConversationStore};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::warn;
use ulid::Ulid;

/// Header carrying the id of the conversation a streamed response belongs to.
pub const X_CONVERSATION_ID: &str = "x-conversation-id";

const X_REQUEST_ID: &str = "x-request-id";

/// Shared application state.
pub struct AppState {
    /// Conversation and message records.
    pub store: Arc<dyn ConversationStore>,
    /// Handles chat messages.
    pub chat: ChatOrchestrator,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(store: Arc<dyn ConversationStore>, chat: ChatOrchestrator) -> Self {
        Self { store, chat }
    }
}

/// Stamps each request with a fresh ULID unless the caller sent one.
#[derive(Clone, Copy, Default)]
struct MakeRequestUlid;

impl MakeRequestId for MakeRequestUlid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Ulid::new().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Builds the HTTP router.
pub fn router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route(
            "/conversations",
            post(routes::create_conversation).get(routes::list_conversations),
        )
        .route("/conversations/new", post(routes::create_conversation))
        .route("/conversations/{id}", get(routes::get_conversation))
        .route("/conversations/{id}/messages", get(routes::list_messages))
        .route("/chat", post(routes::chat))
        .route("/messages", post(routes::chat))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    HeaderName::from_static(X_REQUEST_ID),
                    MakeRequestUlid,
                ))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .headers()
                            .get(X_REQUEST_ID)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id,
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    X_REQUEST_ID,
                )))
                .layer(cors(cors_origins)),
        )
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([
            HeaderName::from_static(X_CONVERSATION_ID),
            HeaderName::from_static(X_REQUEST_ID),
        ])
}
