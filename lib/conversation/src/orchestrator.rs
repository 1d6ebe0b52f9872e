//! Conversation orchestrator.
//!
//! [`ChatOrchestrator::handle_user_message`] validates and persists the
//! user's message, then hands generation to its own task which relays model
//! output to the caller through a bounded channel. The task owns the stream
//! session, so the placeholder message is finalized and the busy-lock
//! released however the generation ends: success, model or store failure,
//! or the caller dropping the stream.

use crate::error::ChatError;
use crate::event::ChatEvent;
use crate::lock::ConversationLocks;
use crate::message::{Message, MessageRole, derive_title};
use crate::session::StreamSession;
use crate::store::ConversationStore;
use crate::tool::ToolGateway;
use futures::{Stream, StreamExt};
use parley_ai::{Fragment, ModelClient, ModelRequest, ToolCall, ToolSpec};
use parley_core::{ConversationId, MessageId};
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Generation limits and prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Prepended to every model request.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Tool round trips allowed per generation.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Failed tool calls tolerated per generation before giving up.
    #[serde(default = "default_max_tool_failures")]
    pub max_tool_failures: u32,

    /// Events buffered between the generation task and the caller.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_tool_rounds() -> u32 {
    8
}

fn default_max_tool_failures() -> u32 {
    3
}

fn default_channel_capacity() -> usize {
    16
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tool_rounds: default_max_tool_rounds(),
            max_tool_failures: default_max_tool_failures(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// The output of one generation.
///
/// Yields events in order and ends after the terminal event. Dropping it
/// stops the generation; the partial response is kept.
#[derive(Debug)]
pub struct ChatStream {
    conversation_id: ConversationId,
    message_id: MessageId,
    events: ReceiverStream<ChatEvent>,
}

impl ChatStream {
    #[must_use]
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// The assistant message being generated.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl Stream for ChatStream {
    type Item = ChatEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

enum Outcome {
    Completed,
    Failed(ChatError),
    Disconnected,
}

/// Entry point for user messages.
#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<dyn ConversationStore>,
    model: Arc<dyn ModelClient>,
    tools: Option<Arc<dyn ToolGateway>>,
    locks: ConversationLocks,
    config: ChatConfig,
}

impl ChatOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelClient>,
        config: ChatConfig,
    ) -> Self {
        Self {
            store,
            model,
            tools: None,
            locks: ConversationLocks::new(),
            config,
        }
    }

    /// Lets the model call tools through `gateway`.
    #[must_use]
    pub fn with_tools(mut self, gateway: Arc<dyn ToolGateway>) -> Self {
        self.tools = Some(gateway);
        self
    }

    #[must_use]
    pub fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    /// The model identifier generations run against.
    #[must_use]
    pub fn model(&self) -> &str {
        self.model.model()
    }

    /// Whether a generation is in flight for the conversation.
    #[must_use]
    pub fn is_busy(&self, conversation_id: ConversationId) -> bool {
        self.locks.is_busy(conversation_id)
    }

    /// Handles a user message and starts generating the response.
    ///
    /// With `None`, a new conversation is created. The user message and an
    /// empty assistant placeholder are persisted before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Validation`] for blank text,
    /// [`ChatError::NotFound`] for an unknown conversation,
    /// [`ChatError::ConversationBusy`] while another generation runs for the
    /// conversation, and [`ChatError::Persistence`] if the store fails. Later
    /// failures arrive as the terminal event of the stream.
    #[instrument(skip(self, text), fields(conversation_id = ?conversation_id, chars = text.chars().count()))]
    pub async fn handle_user_message(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
    ) -> Result<ChatStream, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Validation {
                reason: "message text must not be empty".to_string(),
            });
        }

        let conversation = match conversation_id {
            Some(id) => self.store.get_conversation(id).await?,
            None => {
                let conversation = self.store.create_conversation().await?;
                info!(conversation_id = %conversation.id, "created conversation");
                conversation
            }
        };

        let guard = self
            .locks
            .try_acquire(conversation.id)
            .ok_or(ChatError::ConversationBusy {
                id: conversation.id,
            })?;

        self.store
            .create_message(conversation.id, MessageRole::User, text)
            .await?;
        if conversation.title.is_none() {
            if let Some(title) = derive_title(text) {
                if let Err(e) = self.store.set_title(conversation.id, &title).await {
                    warn!(conversation_id = %conversation.id, error = %e, "failed to set conversation title");
                }
            }
        }

        let history = self.store.list_messages(conversation.id).await?;
        let placeholder = self
            .store
            .create_message(conversation.id, MessageRole::Assistant, "")
            .await?;

        // No await between here and the spawn: the task owns finalization.
        let turns = history
            .iter()
            .filter(|m| m.role != MessageRole::Tool && !m.content.is_empty())
            .map(Message::to_turn)
            .collect();
        let session = StreamSession::new(guard, placeholder.id, turns);

        let span = info_span!(
            "generation",
            session_id = %session.id,
            conversation_id = %conversation.id,
            message_id = %placeholder.id,
        );
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = self.clone();
        tokio::spawn(worker.run(session, tx).instrument(span));

        Ok(ChatStream {
            conversation_id: conversation.id,
            message_id: placeholder.id,
            events: ReceiverStream::new(rx),
        })
    }

    async fn discover_tools(&self) -> Vec<ToolSpec> {
        let Some(gateway) = &self.tools else {
            return Vec::new();
        };
        match gateway.list_tools().await {
            Ok(tools) => {
                debug!(count = tools.len(), "discovered tools");
                tools
            }
            Err(e) => {
                warn!(error = %e, "tool discovery failed, continuing without tools");
                Vec::new()
            }
        }
    }

    async fn run(self, mut session: StreamSession, tx: mpsc::Sender<ChatEvent>) {
        let outcome = self.generate(&mut session, &tx).await;

        let message_id = session.message_id;
        let content = session.accumulated().to_string();
        let finalized = self.store.finalize_message(message_id, &content).await;
        // Releases the busy-lock before the caller sees the terminal event.
        drop(session);

        let terminal = match (outcome, finalized) {
            (Outcome::Disconnected, finalized) => {
                if let Err(e) = finalized {
                    error!(error = %e, "failed to finalize abandoned response");
                }
                info!(chars = content.chars().count(), "caller disconnected, partial response kept");
                return;
            }
            (Outcome::Completed, Ok(_)) => {
                info!(chars = content.chars().count(), "generation completed");
                ChatEvent::completed(message_id, content)
            }
            (Outcome::Completed, Err(e)) => {
                error!(error = %e, "failed to finalize response");
                ChatEvent::failed(message_id, content, &ChatError::Persistence(e))
            }
            (Outcome::Failed(err), finalized) => {
                if let Err(e) = finalized {
                    error!(error = %e, "failed to finalize partial response");
                }
                warn!(kind = err.kind(), error = %err, "generation failed");
                ChatEvent::failed(message_id, content, &err)
            }
        };

        if tx.send(terminal).await.is_err() {
            debug!("caller went away before the terminal event");
        }
    }

    async fn generate(
        &self,
        session: &mut StreamSession,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Outcome {
        let tools = tokio::select! {
            biased;
            () = tx.closed() => return Outcome::Disconnected,
            tools = self.discover_tools() => tools,
        };

        loop {
            let request = self.request(session, &tools);
            let opened = tokio::select! {
                biased;
                () = tx.closed() => return Outcome::Disconnected,
                opened = self.model.stream(&request) => opened,
            };
            let mut fragments = match opened {
                Ok(fragments) => fragments,
                Err(e) => return Outcome::Failed(e.into()),
            };

            let mut calls = Vec::new();
            loop {
                let next = tokio::select! {
                    biased;
                    () = tx.closed() => return Outcome::Disconnected,
                    next = fragments.next() => next,
                };

                match next {
                    None => break,
                    Some(Err(e)) => return Outcome::Failed(e.into()),
                    Some(Ok(Fragment::ToolCall(call))) => calls.push(call),
                    Some(Ok(Fragment::Text { content })) => {
                        if content.is_empty() {
                            continue;
                        }
                        let cumulative = session.append(&content).to_string();
                        if let Err(e) = self
                            .store
                            .update_message_content(session.message_id, &cumulative)
                            .await
                        {
                            return Outcome::Failed(e.into());
                        }
                        if tx
                            .send(ChatEvent::partial(session.message_id, cumulative))
                            .await
                            .is_err()
                        {
                            return Outcome::Disconnected;
                        }
                    }
                }
            }

            if calls.is_empty() {
                return Outcome::Completed;
            }

            // The model continues from the tool results in a fresh invocation.
            for call in calls {
                let answered = tokio::select! {
                    biased;
                    () = tx.closed() => return Outcome::Disconnected,
                    answered = self.run_tool(session, call) => answered,
                };
                if let Err(e) = answered {
                    return Outcome::Failed(e);
                }
            }
        }
    }

    async fn run_tool(&self, session: &mut StreamSession, call: ToolCall) -> Result<(), ChatError> {
        let Some(gateway) = &self.tools else {
            return Err(ChatError::ToolInvocation {
                reason: format!(
                    "model requested tool '{}' but no tool gateway is configured",
                    call.name
                ),
            });
        };
        if session.tool_rounds() >= self.config.max_tool_rounds {
            return Err(ChatError::ToolInvocation {
                reason: format!(
                    "tool round limit of {} exceeded",
                    self.config.max_tool_rounds
                ),
            });
        }

        let output = match gateway.call_tool(&call).await {
            Ok(output) => {
                debug!(tool = %call.name, bytes = output.len(), "tool call succeeded");
                output
            }
            Err(e) => {
                let failures = session.record_tool_failure();
                warn!(tool = %call.name, failures, error = %e, "tool call failed");
                if failures > self.config.max_tool_failures {
                    return Err(ChatError::ToolInvocation {
                        reason: format!("{failures} tool calls failed, last: {e}"),
                    });
                }
                format!("tool '{}' failed: {e}", call.name)
            }
        };

        session.record_tool_round(call, output);
        Ok(())
    }

    fn request(&self, session: &StreamSession, tools: &[ToolSpec]) -> ModelRequest {
        let request = ModelRequest::new(session.turns().to_vec()).with_tools(tools.to_vec());
        match &self.config.system_prompt {
            Some(system) => request.with_system(system.clone()),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StoreError, ToolError};
    use crate::memory::InMemoryConversationStore;
    use crate::message::Conversation;
    use async_trait::async_trait;
    use parley_ai::{FragmentStream, ModelError, TurnRole};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    type Script = Result<Vec<Result<Fragment, ModelError>>, ModelError>;

    /// Plays one script per invocation and records every request.
    #[derive(Default)]
    struct ScriptedModel {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ModelRequest> {
            self.requests.lock().expect("requests").clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream(&self, request: &ModelRequest) -> Result<FragmentStream, ModelError> {
            self.requests.lock().expect("requests").push(request.clone());
            let script = self
                .scripts
                .lock()
                .expect("scripts")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            Ok(Box::pin(futures::stream::iter(script?)))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    /// Streams whatever the test pushes into the paired sender.
    struct ChannelModel {
        fragments: Mutex<Option<mpsc::Receiver<Result<Fragment, ModelError>>>>,
    }

    impl ChannelModel {
        fn new() -> (Arc<Self>, mpsc::Sender<Result<Fragment, ModelError>>) {
            let (tx, rx) = mpsc::channel(8);
            let model = Arc::new(Self {
                fragments: Mutex::new(Some(rx)),
            });
            (model, tx)
        }
    }

    #[async_trait]
    impl ModelClient for ChannelModel {
        async fn stream(&self, _request: &ModelRequest) -> Result<FragmentStream, ModelError> {
            let rx = self
                .fragments
                .lock()
                .expect("fragments")
                .take()
                .expect("single invocation");
            Ok(Box::pin(ReceiverStream::new(rx)))
        }

        fn model(&self) -> &str {
            "channel"
        }
    }

    /// In-memory store whose content updates can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryConversationStore,
        fail_updates: AtomicBool,
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        async fn create_conversation(&self) -> Result<Conversation, StoreError> {
            self.inner.create_conversation().await
        }

        async fn get_conversation(&self, id: ConversationId) -> Result<Conversation, StoreError> {
            self.inner.get_conversation(id).await
        }

        async fn set_title(&self, id: ConversationId, title: &str) -> Result<(), StoreError> {
            self.inner.set_title(id, title).await
        }

        async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
            self.inner.list_conversations().await
        }

        async fn create_message(
            &self,
            conversation_id: ConversationId,
            role: MessageRole,
            content: &str,
        ) -> Result<Message, StoreError> {
            self.inner.create_message(conversation_id, role, content).await
        }

        async fn update_message_content(
            &self,
            id: MessageId,
            content: &str,
        ) -> Result<(), StoreError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::Database {
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.update_message_content(id, content).await
        }

        async fn finalize_message(
            &self,
            id: MessageId,
            content: &str,
        ) -> Result<Message, StoreError> {
            self.inner.finalize_message(id, content).await
        }

        async fn list_messages(
            &self,
            conversation_id: ConversationId,
        ) -> Result<Vec<Message>, StoreError> {
            self.inner.list_messages(conversation_id).await
        }
    }

    /// Answers every call with the same result and counts calls.
    struct FakeTools {
        listing: Result<Vec<ToolSpec>, ToolError>,
        answer: Result<String, ToolError>,
        calls: Mutex<Vec<ToolCall>>,
    }

    impl FakeTools {
        fn answering(answer: Result<String, ToolError>) -> Arc<Self> {
            Arc::new(Self {
                listing: Ok(vec![ToolSpec {
                    name: "lookup".to_string(),
                    description: "Looks things up".to_string(),
                    input_schema: serde_json::json!({"type": "object"}),
                }]),
                answer,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolGateway for FakeTools {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
            self.listing.clone()
        }

        async fn call_tool(&self, call: &ToolCall) -> Result<String, ToolError> {
            self.calls.lock().expect("calls").push(call.clone());
            self.answer.clone()
        }
    }

    /// Never answers the calls it is configured to stall on.
    struct StalledTools {
        stall_listing: bool,
    }

    #[async_trait]
    impl ToolGateway for StalledTools {
        async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
            if self.stall_listing {
                std::future::pending::<()>().await;
            }
            Ok(Vec::new())
        }

        async fn call_tool(&self, _call: &ToolCall) -> Result<String, ToolError> {
            std::future::pending().await
        }
    }

    fn text(content: &str) -> Result<Fragment, ModelError> {
        Ok(Fragment::text(content))
    }

    fn lookup() -> Result<Fragment, ModelError> {
        Ok(Fragment::ToolCall(ToolCall::new(
            "call_1",
            "lookup",
            serde_json::json!({"q": "answer"}),
        )))
    }

    fn orchestrator(
        store: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelClient>,
    ) -> ChatOrchestrator {
        ChatOrchestrator::new(store, model, ChatConfig::default())
    }

    async fn wait_until_idle(orchestrator: &ChatOrchestrator, id: ConversationId) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while orchestrator.is_busy(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("busy-lock released");
    }

    #[tokio::test]
    async fn new_conversation_streams_cumulative_text() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![text("Hi"), text(" there"), text("!")])]);
        let chat = orchestrator(store.clone(), model.clone());

        let stream = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let message_id = stream.message_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        let texts: Vec<&str> = events.iter().map(ChatEvent::text).collect();
        assert_eq!(texts, vec!["Hi", "Hi there", "Hi there!", "Hi there!"]);
        assert!(events.iter().all(|e| e.message_id == message_id));
        assert!(events[..3].iter().all(|e| !e.is_terminal()));
        assert!(events[3].done);
        assert!(!chat.is_busy(conversation_id));

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].id, message_id);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "Hi there!");
        assert!(messages[1].is_finalized());

        let conversation = store
            .get_conversation(conversation_id)
            .await
            .expect("conversation");
        assert_eq!(conversation.title.as_deref(), Some("Hello"));

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].turns.len(), 1);
        assert_eq!(requests[0].turns[0].content, "Hello");
    }

    #[tokio::test]
    async fn model_timeout_keeps_partial_content() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![
            text("Par"),
            Err(ModelError::Timeout { waited_ms: 60_000 }),
        ])]);
        let chat = orchestrator(store.clone(), model);

        let stream = chat
            .handle_user_message(None, "Tell me a story")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text(), "Par");
        let failure = events[1].error.as_ref().expect("error event");
        assert_eq!(failure.kind, "ModelTimeoutError");
        assert_eq!(events[1].text(), "Par");
        assert!(!events[1].done);
        assert!(!chat.is_busy(conversation_id));

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages[1].content, "Par");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn disconnect_finalizes_partial_content() {
        let store = Arc::new(InMemoryConversationStore::new());
        let (model, fragments) = ChannelModel::new();
        let chat = orchestrator(store.clone(), model);

        let mut stream = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let message_id = stream.message_id();

        fragments.send(text("Hi")).await.expect("send");
        assert_eq!(stream.next().await.expect("event").text(), "Hi");
        fragments.send(text(" there")).await.expect("send");
        assert_eq!(stream.next().await.expect("event").text(), "Hi there");
        assert!(chat.is_busy(conversation_id));

        drop(stream);
        wait_until_idle(&chat, conversation_id).await;

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, message_id);
        assert_eq!(messages[1].content, "Hi there");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn concurrent_message_rejected_while_busy() {
        let store = Arc::new(InMemoryConversationStore::new());
        let (model, fragments) = ChannelModel::new();
        let chat = orchestrator(store.clone(), model);

        let stream = chat
            .handle_user_message(None, "First")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();

        let err = chat
            .handle_user_message(Some(conversation_id), "Second")
            .await
            .err()
            .expect("busy");
        assert_eq!(err, ChatError::ConversationBusy { id: conversation_id });
        assert_eq!(err.kind(), "ConversationBusyError");
        assert_eq!(
            store.list_messages(conversation_id).await.expect("messages").len(),
            2
        );

        fragments.send(text("Done")).await.expect("send");
        drop(fragments);
        let events: Vec<ChatEvent> = stream.collect().await;
        assert!(events.last().expect("terminal").done);
        assert!(!chat.is_busy(conversation_id));
    }

    #[tokio::test]
    async fn blank_message_rejected_before_persisting() {
        let store = Arc::new(InMemoryConversationStore::new());
        let chat = orchestrator(store.clone(), ScriptedModel::new(Vec::new()));

        let err = chat
            .handle_user_message(None, " \n\t ")
            .await
            .err()
            .expect("invalid");

        assert_eq!(err.kind(), "ValidationError");
        assert!(store.list_conversations().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_rejected() {
        let store = Arc::new(InMemoryConversationStore::new());
        let chat = orchestrator(store.clone(), ScriptedModel::new(Vec::new()));
        let missing = ConversationId::new();

        let err = chat
            .handle_user_message(Some(missing), "Hello")
            .await
            .err()
            .expect("not found");

        assert_eq!(err, ChatError::NotFound { id: missing });
        assert!(store.list_conversations().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn follow_up_sees_history_and_keeps_title() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![
            Ok(vec![text("Hi!")]),
            Err(ModelError::Unavailable {
                status: Some(503),
                reason: "overloaded".to_string(),
                retryable: true,
            }),
            Ok(vec![text("Fine.")]),
        ]);
        let chat = ChatOrchestrator::new(
            store.clone(),
            model.clone(),
            ChatConfig {
                system_prompt: Some("Be brief.".to_string()),
                ..ChatConfig::default()
            },
        );

        let first = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted");
        let conversation_id = first.conversation_id();
        first.collect::<Vec<_>>().await;

        // The failed generation leaves an empty assistant message behind.
        let failed: Vec<ChatEvent> = chat
            .handle_user_message(Some(conversation_id), "Still there?")
            .await
            .expect("accepted")
            .collect()
            .await;
        assert_eq!(
            failed[0].error.as_ref().map(|f| f.kind.as_str()),
            Some("ModelUnavailableError")
        );

        chat.handle_user_message(Some(conversation_id), "How are you?")
            .await
            .expect("accepted")
            .collect::<Vec<_>>()
            .await;

        let requests = model.requests();
        let last = requests.last().expect("request");
        assert_eq!(last.system.as_deref(), Some("Be brief."));
        let turns: Vec<(TurnRole, &str)> = last
            .turns
            .iter()
            .map(|t| (t.role, t.content.as_str()))
            .collect();
        assert_eq!(
            turns,
            vec![
                (TurnRole::User, "Hello"),
                (TurnRole::Assistant, "Hi!"),
                (TurnRole::User, "Still there?"),
                (TurnRole::User, "How are you?"),
            ]
        );

        let conversation = store
            .get_conversation(conversation_id)
            .await
            .expect("conversation");
        assert_eq!(conversation.title.as_deref(), Some("Hello"));
        assert_eq!(
            store.list_messages(conversation_id).await.expect("messages").len(),
            6
        );
    }

    #[tokio::test]
    async fn tool_round_trip_is_invisible_in_events() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![
            Ok(vec![text("Let me check. "), lookup()]),
            Ok(vec![text("It is 42.")]),
        ]);
        let tools = FakeTools::answering(Ok("42".to_string()));
        let chat = orchestrator(store.clone(), model.clone()).with_tools(tools.clone());

        let stream = chat
            .handle_user_message(None, "What is the answer?")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        let texts: Vec<&str> = events.iter().map(ChatEvent::text).collect();
        assert_eq!(
            texts,
            vec![
                "Let me check. ",
                "Let me check. It is 42.",
                "Let me check. It is 42."
            ]
        );
        assert!(events.last().expect("terminal").done);
        assert_eq!(tools.calls.lock().expect("calls").len(), 1);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let follow_up = &requests[1].turns;
        assert_eq!(follow_up.len(), 3);
        assert_eq!(follow_up[1].content, "Let me check. ");
        assert_eq!(
            follow_up[1].tool_call.as_ref().map(|c| c.name.as_str()),
            Some("lookup")
        );
        assert_eq!(follow_up[2].role, TurnRole::Tool);
        assert_eq!(follow_up[2].content, "42");

        // Tool turns are not persisted.
        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Let me check. It is 42.");
    }

    #[tokio::test]
    async fn repeated_tool_failures_escalate() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![
            Ok(vec![lookup()]),
            Ok(vec![lookup()]),
            Ok(vec![text("unreachable")]),
        ]);
        let tools = FakeTools::answering(Err(ToolError::Unavailable {
            reason: "connection refused".to_string(),
        }));
        let chat = ChatOrchestrator::new(
            store.clone(),
            model.clone(),
            ChatConfig {
                max_tool_failures: 1,
                ..ChatConfig::default()
            },
        )
        .with_tools(tools);

        let stream = chat
            .handle_user_message(None, "Look it up")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        assert_eq!(events.len(), 1);
        let failure = events[0].error.as_ref().expect("error event");
        assert_eq!(failure.kind, "ToolInvocationError");

        // The first failure was reported to the model as the tool result.
        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let reported = requests[1].turns.last().expect("tool result");
        assert_eq!(reported.role, TurnRole::Tool);
        assert!(reported.content.starts_with("tool 'lookup' failed:"));

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn tool_round_limit_enforced() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![lookup()]), Ok(vec![lookup()])]);
        let chat = ChatOrchestrator::new(
            store,
            model,
            ChatConfig {
                max_tool_rounds: 1,
                ..ChatConfig::default()
            },
        )
        .with_tools(FakeTools::answering(Ok("again".to_string())));

        let events: Vec<ChatEvent> = chat
            .handle_user_message(None, "Loop")
            .await
            .expect("accepted")
            .collect()
            .await;

        assert_eq!(
            events.last().and_then(|e| e.error.as_ref()).map(|f| f.kind.as_str()),
            Some("ToolInvocationError")
        );
    }

    #[tokio::test]
    async fn tool_call_without_gateway_fails() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![text("Checking"), lookup()])]);
        let chat = orchestrator(store.clone(), model);

        let stream = chat
            .handle_user_message(None, "Look it up")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        let last = events.last().expect("terminal");
        assert_eq!(
            last.error.as_ref().map(|f| f.kind.as_str()),
            Some("ToolInvocationError")
        );
        assert_eq!(last.text(), "Checking");
        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages[1].content, "Checking");
    }

    #[tokio::test]
    async fn tool_discovery_failure_is_not_fatal() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![text("Hi")])]);
        let tools = Arc::new(FakeTools {
            listing: Err(ToolError::Unavailable {
                reason: "down".to_string(),
            }),
            answer: Ok(String::new()),
            calls: Mutex::new(Vec::new()),
        });
        let chat = orchestrator(store, model.clone()).with_tools(tools);

        let events: Vec<ChatEvent> = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted")
            .collect()
            .await;

        assert!(events.last().expect("terminal").done);
        assert!(model.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn model_unavailable_finalizes_empty_response() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Err(ModelError::Unavailable {
            status: Some(401),
            reason: "bad key".to_string(),
            retryable: false,
        })]);
        let chat = orchestrator(store.clone(), model);

        let stream = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].error.as_ref().map(|f| f.kind.as_str()),
            Some("ModelUnavailableError")
        );
        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages[1].content, "");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn store_failure_mid_stream_is_terminal() {
        let store = Arc::new(FlakyStore::default());
        let model = ScriptedModel::new(vec![Ok(vec![text("Hi"), text(" there")])]);
        let chat = orchestrator(store.clone(), model);
        store.fail_updates.store(true, Ordering::SeqCst);

        let stream = chat
            .handle_user_message(None, "Hello")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        let events: Vec<ChatEvent> = stream.collect().await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].error.as_ref().map(|f| f.kind.as_str()),
            Some("PersistenceError")
        );
        assert_eq!(events[0].text(), "Hi");

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages[1].content, "Hi");
        assert!(messages[1].is_finalized());
        assert!(!chat.is_busy(conversation_id));
    }

    #[tokio::test]
    async fn slow_tool_discovery_does_not_hold_up_the_response() {
        let store = Arc::new(InMemoryConversationStore::new());
        let chat = orchestrator(store.clone(), ScriptedModel::new(Vec::new()))
            .with_tools(Arc::new(StalledTools {
                stall_listing: true,
            }));

        let stream = tokio::time::timeout(
            Duration::from_millis(500),
            chat.handle_user_message(None, "Hello"),
        )
        .await
        .expect("returned before tool discovery finished")
        .expect("accepted");
        let conversation_id = stream.conversation_id();
        assert!(chat.is_busy(conversation_id));

        drop(stream);
        wait_until_idle(&chat, conversation_id).await;

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content, "");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn disconnect_during_tool_call_finalizes() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![Ok(vec![text("Checking"), lookup()])]);
        let chat = orchestrator(store.clone(), model).with_tools(Arc::new(StalledTools {
            stall_listing: false,
        }));

        let mut stream = chat
            .handle_user_message(None, "Look it up")
            .await
            .expect("accepted");
        let conversation_id = stream.conversation_id();
        assert_eq!(stream.next().await.expect("event").text(), "Checking");

        drop(stream);
        wait_until_idle(&chat, conversation_id).await;

        let messages = store.list_messages(conversation_id).await.expect("messages");
        assert_eq!(messages[1].content, "Checking");
        assert!(messages[1].is_finalized());
    }

    #[tokio::test]
    async fn every_tool_call_in_a_response_is_answered() {
        let store = Arc::new(InMemoryConversationStore::new());
        let model = ScriptedModel::new(vec![
            Ok(vec![
                text("Comparing. "),
                Ok(Fragment::ToolCall(ToolCall::new(
                    "call_1",
                    "lookup",
                    serde_json::json!({"q": "oslo"}),
                ))),
                Ok(Fragment::ToolCall(ToolCall::new(
                    "call_2",
                    "lookup",
                    serde_json::json!({"q": "bergen"}),
                ))),
            ]),
            Ok(vec![text("Both wet.")]),
        ]);
        let tools = FakeTools::answering(Ok("rain".to_string()));
        let chat = orchestrator(store, model.clone()).with_tools(tools.clone());

        let events: Vec<ChatEvent> = chat
            .handle_user_message(None, "Compare the weather")
            .await
            .expect("accepted")
            .collect()
            .await;

        assert!(events.last().expect("terminal").done);
        assert_eq!(events.last().expect("terminal").text(), "Comparing. Both wet.");

        let called: Vec<String> = tools
            .calls
            .lock()
            .expect("calls")
            .iter()
            .map(|c| c.id.clone())
            .collect();
        assert_eq!(called, vec!["call_1", "call_2"]);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        let follow_up = &requests[1].turns;
        let roles: Vec<TurnRole> = follow_up.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![
                TurnRole::User,
                TurnRole::Assistant,
                TurnRole::Tool,
                TurnRole::Assistant,
                TurnRole::Tool
            ]
        );
        assert_eq!(follow_up[1].content, "Comparing. ");
        assert_eq!(follow_up[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(follow_up[3].content, "");
        assert_eq!(follow_up[4].tool_call_id.as_deref(), Some("call_2"));
    }
}
