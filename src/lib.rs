pub mod context;
pub mod error;
pub mod events;
pub mod inference;
pub mod openapi;
pub mod session;
pub mod tools;
pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use context::ConversationStore;
pub use error::{ChatError, InferenceError, PersistError};
pub use events::ChatEvent;
pub use inference::{InferenceProvider, OllamaProvider, OpenAiProvider};
pub use openapi::RemoteOperation;
pub use session::SessionParams;
pub use tools::{
    ChangeSystemPrompt, FnHandler, PromptState, RemoteToolInvoker, SharedPromptState,
    StoreContextualData, ToolHandler, ToolRegistry, ToolSource,
};
pub use types::{Message, ModelReply, ModelRequest, Role, ToolCall, ToolSchema, Usage};

/// Optional per-session behaviours.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Stamp every stored message with the time it was appended.
    pub tag_timestamps: bool,
    /// Stamp every stored message with the index of its user turn.
    pub tag_turn_index: bool,
    /// Append the current date and time to the system message.
    pub inject_wall_clock: bool,
    /// Stop sending the system message once this many turns have completed.
    pub system_prompt_drop_after_turn: Option<usize>,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub model: String,
    /// How many of the most recent messages are sent with each request.
    pub max_history: usize,
    pub user_name: String,
    /// Model calls allowed per turn before the turn is abandoned.
    pub max_tool_rounds: usize,
    pub tool_server_url: Option<String>,
    pub options: ChatOptions,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            max_history: 20,
            user_name: "User".into(),
            max_tool_rounds: 16,
            tool_server_url: None,
            options: ChatOptions::default(),
        }
    }
}

/// Result of one user turn.
#[derive(Debug)]
pub struct ChatReply {
    pub text: String,
    pub rounds: usize,
    pub usage: Usage,
}

/// A chat session: history, prompt state, tools, and the loop that lets the
/// model call those tools until it answers in plain text.
pub struct ChatSession {
    provider: Box<dyn InferenceProvider>,
    tools: ToolRegistry,
    store: ConversationStore,
    prompt: SharedPromptState,
    config: ChatConfig,
}

impl ChatSession {
    /// Create a session with the two built-in prompt tools registered.
    pub fn new(
        provider: impl InferenceProvider + 'static,
        system_prompt: impl Into<String>,
        config: ChatConfig,
    ) -> Self {
        let prompt = PromptState::shared(system_prompt);
        let tools = ToolRegistry::new()
            .add(
                ChangeSystemPrompt::schema(),
                ChangeSystemPrompt::new(prompt.clone()),
            )
            .add(
                StoreContextualData::schema(),
                StoreContextualData::new(prompt.clone()),
            );
        Self {
            provider: Box::new(provider),
            tools,
            store: ConversationStore::new(),
            prompt,
            config,
        }
    }

    /// Register a local tool. The built-in prompt tools cannot be replaced.
    pub fn with_local_tool(mut self, schema: ToolSchema, handler: impl ToolHandler + 'static) -> Self {
        if is_builtin(&schema.name) {
            warn!(tool = %schema.name, "name is reserved for a built-in tool, skipping");
            return self;
        }
        self.tools = std::mem::take(&mut self.tools).add(schema, handler);
        self
    }

    /// Register externally defined tools, pairing schemas and handlers by name.
    pub fn with_local_definitions(
        mut self,
        schemas: Vec<ToolSchema>,
        mut handlers: HashMap<String, Arc<dyn ToolHandler>>,
    ) -> Self {
        let schemas = schemas
            .into_iter()
            .filter(|schema| {
                let reserved = is_builtin(&schema.name);
                if reserved {
                    warn!(tool = %schema.name, "name is reserved for a built-in tool, skipping");
                }
                !reserved
            })
            .collect();
        handlers.retain(|name, _| !is_builtin(name));
        self.tools = std::mem::take(&mut self.tools).with_local_definitions(schemas, handlers);
        self
    }

    pub fn with_remote_tools(
        mut self,
        invoker: RemoteToolInvoker,
        operations: Vec<RemoteOperation>,
    ) -> Self {
        self.config.tool_server_url = Some(invoker.base_url().to_string());
        self.tools =
            std::mem::take(&mut self.tools).with_remote_operations(Arc::new(invoker), operations);
        self
    }

    /// Load the tool server's OpenAPI document and register its operations.
    /// An unreachable server leaves the session with its local tools only.
    pub async fn connect_tool_server(self, invoker: RemoteToolInvoker) -> Self {
        let operations =
            openapi::fetch_tools(invoker.client(), invoker.base_url(), invoker.timeout()).await;
        info!(
            url = invoker.base_url(),
            tools = operations.len(),
            "connected tool server"
        );
        self.with_remote_tools(invoker, operations)
    }

    /// Send a user message and return the model's final reply text.
    pub async fn submit_user_message(&mut self, text: &str) -> Result<String, ChatError> {
        Ok(self.invoke(text).await?.text)
    }

    /// Run one turn to completion.
    pub async fn invoke(&mut self, text: &str) -> Result<ChatReply, ChatError> {
        self.run_turn(text, None, None).await
    }

    /// Run one turn, aborting between rounds or mid-request when `cancel` fires.
    pub async fn invoke_with_cancel(
        &mut self,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<ChatReply, ChatError> {
        self.run_turn(text, Some(cancel), None).await
    }

    /// Run one turn, reporting progress on `tx`.
    pub async fn invoke_streaming(
        &mut self,
        text: &str,
        tx: Sender<ChatEvent>,
    ) -> Result<ChatReply, ChatError> {
        self.run_turn(text, None, Some(tx)).await
    }

    /// Run one turn with both cancellation and progress events.
    pub async fn run_turn(
        &mut self,
        text: &str,
        cancel: Option<CancellationToken>,
        tx: Option<Sender<ChatEvent>>,
    ) -> Result<ChatReply, ChatError> {
        let turn = self.user_turns();
        let user = self.stamp(Message::user(text), turn);
        self.store.push(user);

        // A window can open partway through an earlier tool exchange; results
        // whose call record fell outside it are not sent.
        let window = self.store.window(self.config.max_history);
        let orphaned = window.iter().take_while(|m| m.role == Role::Tool).count();
        let mut outbound = window[orphaned..].to_vec();
        let tools = self.tools.schemas();
        let mut usage = Usage::default();

        for round in 0..self.config.max_tool_rounds {
            if let Some(ref cancel) = cancel {
                if cancel.is_cancelled() {
                    info!(turn, round, "turn cancelled");
                    return Err(ChatError::Cancelled);
                }
            }

            emit(&tx, ChatEvent::RoundStart { round }).await;
            info!(turn, round, "model round");

            let mut messages = Vec::with_capacity(outbound.len() + 1);
            if let Some(system) = self.system_message(turn).await {
                messages.push(system);
            }
            messages.extend(outbound.iter().cloned());
            let request = ModelRequest {
                model: self.config.model.clone(),
                messages,
                tools: tools.clone(),
            };

            let reply = if let Some(ref cancel) = cancel {
                tokio::select! {
                    result = self.provider.infer(request) => result?,
                    _ = cancel.cancelled() => {
                        info!(turn, round, "turn cancelled during inference");
                        return Err(ChatError::Cancelled);
                    }
                }
            } else {
                self.provider.infer(request).await?
            };
            usage.accumulate(&reply.usage);

            if let Some(ref content) = reply.content {
                if !content.is_empty() {
                    emit(&tx, ChatEvent::Text { content: content.clone() }).await;
                }
            }

            if reply.tool_calls.is_empty() {
                let content = reply.content.unwrap_or_default();
                let answer = self.stamp(Message::assistant(content.clone()), turn);
                self.store.push(answer);
                emit(&tx, ChatEvent::Finished { rounds: round + 1 }).await;
                info!(turn, rounds = round + 1, "turn finished");
                return Ok(ChatReply {
                    text: content,
                    rounds: round + 1,
                    usage,
                });
            }

            let calls = reply.tool_calls;
            let request_msg =
                self.stamp(Message::assistant_tool_calls(reply.content, calls.clone()), turn);
            outbound.push(request_msg.clone());
            self.store.push(request_msg);

            // Later calls may depend on earlier results, so run them in order.
            for call in &calls {
                emit(
                    &tx,
                    ChatEvent::ToolCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                )
                .await;

                let output = self.dispatch(call).await;

                emit(
                    &tx,
                    ChatEvent::ToolResult {
                        name: call.name.clone(),
                        output: output.clone(),
                    },
                )
                .await;

                let result = self.stamp(Message::tool_result(&call.id, output), turn);
                outbound.push(result.clone());
                self.store.push(result);
            }
        }

        warn!(
            max_tool_rounds = self.config.max_tool_rounds,
            "model kept calling tools, giving up on the turn"
        );
        Err(ChatError::ToolLoopExceeded {
            rounds: self.config.max_tool_rounds,
        })
    }

    async fn dispatch(&self, call: &ToolCall) -> String {
        match call.decode_arguments() {
            Ok(input) => self.tools.execute(&call.name, &input).await,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "malformed tool arguments");
                format!("Error executing tool: invalid arguments for {}: {e}", call.name)
            }
        }
    }

    async fn system_message(&self, turn: usize) -> Option<Message> {
        if let Some(limit) = self.config.options.system_prompt_drop_after_turn {
            if turn >= limit {
                return None;
            }
        }

        let state = self.prompt.read().await;
        let mut content = String::new();
        if !state.contextual_data.is_empty() {
            content.push_str(&state.contextual_data);
            content.push_str("\n\n");
        }
        content.push_str(&state.system_prompt);
        if self.config.options.inject_wall_clock {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            content.push_str(&format!("\n\nCurrent date and time: {now}"));
        }
        Some(Message::system(content))
    }

    fn stamp(&self, mut message: Message, turn: usize) -> Message {
        if self.config.options.tag_timestamps {
            message.timestamp = Some(chrono::Utc::now());
        }
        if self.config.options.tag_turn_index {
            message.turn = Some(turn);
        }
        message
    }

    fn user_turns(&self) -> usize {
        self.store
            .messages()
            .iter()
            .filter(|m| m.role == Role::User)
            .count()
    }

    pub fn history(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn formatted_history(&self) -> String {
        self.store
            .formatted(&self.config.user_name, &self.config.model)
    }

    /// Forget the last `turns` exchanges.
    pub fn rewind(&mut self, turns: i64) -> Result<usize, ChatError> {
        self.store.rewind(turns)
    }

    pub async fn system_prompt(&self) -> String {
        self.prompt.read().await.system_prompt.clone()
    }

    pub async fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.prompt.write().await.system_prompt = prompt.into();
    }

    pub async fn contextual_data(&self) -> String {
        self.prompt.read().await.contextual_data.clone()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub async fn serialize_context(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        self.store.save(path).await
    }

    /// Replace the history with one previously written by [`Self::serialize_context`].
    pub async fn deserialize_context(&mut self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        self.store = ConversationStore::load(path).await?;
        info!(messages = self.store.len(), "restored conversation history");
        Ok(())
    }

    pub async fn params(&self) -> SessionParams {
        SessionParams {
            app: session::APP_NAME.into(),
            model: self.config.model.clone(),
            max_history: self.config.max_history,
            user_name: self.config.user_name.clone(),
            tool_server_url: self.config.tool_server_url.clone(),
            system_prompt: self.system_prompt().await,
        }
    }

    pub async fn serialize_params(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        session::save_json(path, &self.params().await).await
    }

    /// Restore model, window size, user name and system prompt. The tool
    /// server URL is informational; tools are not reloaded.
    pub async fn deserialize_params(&mut self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let params: SessionParams = session::load_json(path).await?;
        self.config.model = params.model;
        self.config.max_history = params.max_history;
        self.config.user_name = params.user_name;
        if params.tool_server_url.is_some() {
            self.config.tool_server_url = params.tool_server_url;
        }
        self.set_system_prompt(params.system_prompt).await;
        Ok(())
    }

    /// Write history and params into a fresh timestamped folder under `root`.
    pub async fn backup(
        &self,
        root: impl AsRef<Path>,
        label: Option<&str>,
    ) -> Result<PathBuf, ChatError> {
        let dir = session::create_backup_dir(root.as_ref(), label).await?;
        self.serialize_context(dir.join(session::HISTORY_FILE))
            .await?;
        self.serialize_params(dir.join(session::PARAMS_FILE)).await?;
        info!(dir = %dir.display(), "session backed up");
        Ok(dir)
    }
}

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        tools::builtin::CHANGE_SYSTEM_PROMPT | tools::builtin::STORE_CONTEXTUAL_DATA
    )
}

async fn emit(tx: &Option<Sender<ChatEvent>>, event: ChatEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // --- Mock Provider ---

    type RequestLog = Arc<Mutex<Vec<ModelRequest>>>;

    struct MockProvider {
        responses: Mutex<VecDeque<Result<ModelReply, InferenceError>>>,
        requests: RequestLog,
    }

    impl MockProvider {
        fn new(responses: Vec<ModelReply>) -> (Self, RequestLog) {
            let requests = RequestLog::default();
            let provider = Self {
                responses: Mutex::new(responses.into_iter().map(Ok).collect()),
                requests: requests.clone(),
            };
            (provider, requests)
        }

        fn with_error(error: InferenceError) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from([Err(error)])),
                requests: RequestLog::default(),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for MockProvider {
        async fn infer(&self, request: ModelRequest) -> Result<ModelReply, InferenceError> {
            self.requests.lock().await.push(request);
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(InferenceError::Request(
                    "no more mock responses".into(),
                )))
        }
    }

    // --- Recording Tool ---

    struct RecordingTool {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolHandler for RecordingTool {
        async fn call(&self, input: &Value) -> Result<String, String> {
            self.log.lock().await.push(self.label.to_string());
            Ok(format!("{} saw {}", self.label, input))
        }
    }

    // --- Helpers ---

    fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
        ToolCall::new(id, name, arguments)
    }

    fn session(provider: MockProvider) -> ChatSession {
        ChatSession::new(provider, "You are terse.", ChatConfig::default())
    }

    fn roles(history: &[Message]) -> Vec<Role> {
        history.iter().map(|m| m.role).collect()
    }

    // --- Tests ---

    #[tokio::test]
    async fn plain_answer_ends_turn() {
        let (provider, requests) = MockProvider::new(vec![ModelReply::text("4")]);
        let mut chat = session(provider);

        let reply = chat.submit_user_message("2+2?").await.unwrap();
        assert_eq!(reply, "4");
        assert_eq!(roles(chat.history()), vec![Role::User, Role::Assistant]);
        assert_eq!(chat.history()[1].text(), "4");

        let requests = requests.lock().await;
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert_eq!(sent.messages[0].role, Role::System);
        assert_eq!(sent.messages[0].text(), "You are terse.");
        assert_eq!(sent.messages[1].text(), "2+2?");
        let names: Vec<&str> = sent.tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"change_system_prompt"));
        assert!(names.contains(&"store_contextual_data"));
    }

    #[tokio::test]
    async fn prompt_change_tool_replaces_prompt() {
        let (provider, requests) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call(
                "call_1",
                "change_system_prompt",
                r#"{"sysPrompt":"Be verbose."}"#,
            )]),
            ModelReply::text("OK"),
        ]);
        let mut chat = session(provider);

        let reply = chat.invoke("Change your style").await.unwrap();
        assert_eq!(reply.text, "OK");
        assert_eq!(reply.rounds, 2);
        assert_eq!(chat.system_prompt().await, "Be verbose.");

        assert_eq!(
            roles(chat.history()),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        let tool_msg = &chat.history()[2];
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_msg.text(), "System prompt updated (11 characters)");

        // The second round already sees the new prompt.
        let requests = requests.lock().await;
        assert_eq!(requests[1].messages[0].text(), "Be verbose.");
    }

    #[tokio::test]
    async fn tool_calls_run_in_requested_order() {
        let (provider, requests) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![
                call("call_a", "tool_a", r#"{"n":1}"#),
                call("call_b", "tool_b", r#"{"n":2}"#),
            ]),
            ModelReply::text("Both done."),
        ]);
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chat = session(provider)
            .with_local_tool(
                ToolSchema::new("tool_a", "A", json!({"type": "object"})),
                RecordingTool { label: "A", log: log.clone() },
            )
            .with_local_tool(
                ToolSchema::new("tool_b", "B", json!({"type": "object"})),
                RecordingTool { label: "B", log: log.clone() },
            );

        let reply = chat.invoke("Do two things").await.unwrap();
        assert_eq!(reply.text, "Both done.");
        assert_eq!(*log.lock().await, vec!["A", "B"]);

        let history = chat.history();
        assert_eq!(history[1].tool_calls.len(), 2);
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(history[2].text(), r#"A saw {"n":1}"#);
        assert_eq!(history[3].tool_call_id.as_deref(), Some("call_b"));

        // Second request carries the call record and both results.
        let requests = requests.lock().await;
        let second = &requests[1].messages;
        assert_eq!(
            roles(second),
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_to_model() {
        let (provider, _) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call("call_1", "teleport", "{}")]),
            ModelReply::text("I cannot teleport."),
        ]);
        let mut chat = session(provider);

        let reply = chat.invoke("Teleport me").await.unwrap();
        assert_eq!(reply.text, "I cannot teleport.");
        assert_eq!(chat.history()[2].text(), "unknown tool: teleport");
    }

    #[tokio::test]
    async fn malformed_arguments_are_reported_to_model() {
        let (provider, _) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call("call_1", "change_system_prompt", "{oops")]),
            ModelReply::text("Sorry."),
        ]);
        let mut chat = session(provider);

        let reply = chat.invoke("Change prompt").await.unwrap();
        assert_eq!(reply.text, "Sorry.");
        assert!(chat.history()[2].text().contains("invalid arguments"));
        assert_eq!(chat.system_prompt().await, "You are terse.");
    }

    #[tokio::test]
    async fn remote_server_error_does_not_end_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_time"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let (provider, requests) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call("call_1", "tool_get_time_post", "{}")]),
            ModelReply::text("The clock is broken."),
        ]);
        let ops = vec![RemoteOperation {
            schema: ToolSchema::new("tool_get_time_post", "Get time", json!({"type": "object"})),
            path: "/get_time".into(),
        }];
        let mut chat = session(provider).with_remote_tools(RemoteToolInvoker::new(server.uri()), ops);

        let reply = chat.invoke("What time is it?").await.unwrap();
        assert_eq!(reply.text, "The clock is broken.");
        assert_eq!(reply.rounds, 2);

        let tool_msg = &chat.history()[2];
        assert_eq!(tool_msg.role, Role::Tool);
        assert!(tool_msg.text().starts_with("Error executing tool"));
        assert!(tool_msg.text().contains("500"));
        assert_eq!(requests.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn connect_tool_server_registers_operations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/openapi.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "paths": {
                    "/get_time": {"post": {"operationId": "tool_get_time_post", "summary": "Time"}}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_time"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "noon"})))
            .mount(&server)
            .await;

        let (provider, _) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call("call_1", "tool_get_time_post", "")]),
            ModelReply::text("It is noon."),
        ]);
        let mut chat = session(provider)
            .connect_tool_server(RemoteToolInvoker::new(server.uri()).with_token("pw"))
            .await;

        assert_eq!(chat.tools().len(), 3);
        assert_eq!(chat.config().tool_server_url.as_deref(), Some(server.uri().as_str()));

        chat.invoke("Time?").await.unwrap();
        assert_eq!(chat.history()[2].text(), "noon");
    }

    #[tokio::test]
    async fn unreachable_tool_server_keeps_local_tools() {
        let (provider, _) = MockProvider::new(vec![]);
        let chat = session(provider)
            .connect_tool_server(
                RemoteToolInvoker::new("http://127.0.0.1:1")
                    .with_timeout(std::time::Duration::from_secs(1)),
            )
            .await;
        assert_eq!(
            chat.tools().tool_names(),
            vec!["change_system_prompt", "store_contextual_data"]
        );
    }

    #[tokio::test]
    async fn runaway_tool_loop_is_bounded() {
        let responses = (0..3)
            .map(|i| ModelReply::tool_calls(vec![call(&format!("call_{i}"), "teleport", "{}")]))
            .collect();
        let (provider, _) = MockProvider::new(responses);
        let config = ChatConfig {
            max_tool_rounds: 3,
            ..ChatConfig::default()
        };
        let mut chat = ChatSession::new(provider, "p", config);

        let err = chat.invoke("Keep going").await.unwrap_err();
        assert!(matches!(err, ChatError::ToolLoopExceeded { rounds: 3 }));
        // user + 3 × (call record + result), kept for persistence
        assert_eq!(chat.history().len(), 7);
    }

    #[tokio::test]
    async fn cancellation_before_first_round() {
        let (provider, requests) = MockProvider::new(vec![ModelReply::text("should not reach")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut chat = session(provider);
        let err = chat.invoke_with_cancel("anything", cancel).await.unwrap_err();
        assert!(matches!(err, ChatError::Cancelled));
        assert!(requests.lock().await.is_empty());
        assert_eq!(roles(chat.history()), vec![Role::User]);
    }

    struct SlowProvider;

    #[async_trait]
    impl InferenceProvider for SlowProvider {
        async fn infer(&self, _request: ModelRequest) -> Result<ModelReply, InferenceError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(ModelReply::text("too late"))
        }
    }

    #[tokio::test]
    async fn cancellation_during_inference() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut chat = ChatSession::new(SlowProvider, "p", ChatConfig::default());
        let err = chat.invoke_with_cancel("anything", cancel).await.unwrap_err();
        assert!(matches!(err, ChatError::Cancelled));
        assert_eq!(roles(chat.history()), vec![Role::User]);
    }

    #[tokio::test]
    async fn api_error_propagates() {
        let provider = MockProvider::with_error(InferenceError::ApiError {
            status: 503,
            body: "model loading".into(),
        });
        let mut chat = session(provider);
        let err = chat.invoke("anything").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn requests_only_carry_the_window() {
        let (provider, requests) = MockProvider::new(vec![
            ModelReply::text("a0"),
            ModelReply::text("a1"),
            ModelReply::text("a2"),
        ]);
        let config = ChatConfig {
            max_history: 3,
            ..ChatConfig::default()
        };
        let mut chat = ChatSession::new(provider, "p", config);
        for q in ["q0", "q1", "q2"] {
            chat.invoke(q).await.unwrap();
        }

        assert_eq!(chat.history().len(), 6);
        let requests = requests.lock().await;
        let last: Vec<&str> = requests[2].messages.iter().map(Message::text).collect();
        assert_eq!(last, vec!["p", "q1", "a1", "q2"]);
    }

    #[tokio::test]
    async fn window_never_opens_with_orphaned_tool_results() {
        let (provider, requests) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call("call_1", "teleport", "{}")]),
            ModelReply::text("done"),
            ModelReply::text("again"),
        ]);
        let config = ChatConfig {
            max_history: 3,
            ..ChatConfig::default()
        };
        let mut chat = ChatSession::new(provider, "p", config);
        chat.invoke("first").await.unwrap();
        chat.invoke("second").await.unwrap();

        // Stored: user, call record, result, answer, user, answer.
        assert_eq!(chat.history().len(), 6);
        let requests = requests.lock().await;
        let texts: Vec<&str> = requests[2].messages.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["p", "done", "second"]);
        assert!(requests[2].messages.iter().all(|m| m.role != Role::Tool));
    }

    #[tokio::test]
    async fn builtin_tools_cannot_be_replaced() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (provider, _) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call(
                "call_1",
                "change_system_prompt",
                r#"{"sysPrompt":"Be verbose."}"#,
            )]),
            ModelReply::text("OK"),
        ]);
        let mut handlers: HashMap<String, Arc<dyn ToolHandler>> = HashMap::new();
        handlers.insert(
            "store_contextual_data".into(),
            Arc::new(RecordingTool { label: "defs", log: log.clone() }),
        );
        let mut chat = session(provider)
            .with_local_tool(
                ToolSchema::new("change_system_prompt", "impostor", json!({"type": "object"})),
                RecordingTool { label: "local", log: log.clone() },
            )
            .with_local_definitions(
                vec![ToolSchema::new("store_contextual_data", "impostor", json!({"type": "object"}))],
                handlers,
            );

        assert_eq!(chat.tools().len(), 2);
        assert_ne!(chat.tools().schema("change_system_prompt").unwrap().description, "impostor");
        assert_ne!(chat.tools().schema("store_contextual_data").unwrap().description, "impostor");

        chat.invoke("Change your style").await.unwrap();
        assert_eq!(chat.system_prompt().await, "Be verbose.");
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn backup_failure_is_a_persistence_error() {
        let root = tempfile::NamedTempFile::new().unwrap();
        let (provider, _) = MockProvider::new(vec![]);
        let chat = session(provider);
        let err = chat.backup(root.path(), None).await.unwrap_err();
        assert!(matches!(err, ChatError::Persist(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn contextual_data_precedes_system_prompt() {
        let (provider, requests) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call(
                "call_1",
                "store_contextual_data",
                r#"{"data":"User likes tea."}"#,
            )]),
            ModelReply::text("Noted."),
        ]);
        let mut chat = session(provider);
        chat.invoke("Remember I like tea").await.unwrap();

        assert_eq!(chat.contextual_data().await, "User likes tea.");
        let requests = requests.lock().await;
        assert_eq!(
            requests[1].messages[0].text(),
            "User likes tea.\n\nYou are terse."
        );
    }

    #[tokio::test]
    async fn options_tag_messages_and_drop_system_prompt() {
        let (provider, requests) =
            MockProvider::new(vec![ModelReply::text("one"), ModelReply::text("two")]);
        let config = ChatConfig {
            options: ChatOptions {
                tag_timestamps: true,
                tag_turn_index: true,
                inject_wall_clock: true,
                system_prompt_drop_after_turn: Some(1),
            },
            ..ChatConfig::default()
        };
        let mut chat = ChatSession::new(provider, "p", config);
        chat.invoke("first").await.unwrap();
        chat.invoke("second").await.unwrap();

        let history = chat.history();
        assert!(history.iter().all(|m| m.timestamp.is_some()));
        let turns: Vec<Option<usize>> = history.iter().map(|m| m.turn).collect();
        assert_eq!(turns, vec![Some(0), Some(0), Some(1), Some(1)]);

        let requests = requests.lock().await;
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert!(requests[0].messages[0]
            .text()
            .contains("Current date and time:"));
        assert_eq!(requests[1].messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn streaming_emits_events() {
        let (provider, _) = MockProvider::new(vec![
            ModelReply {
                content: Some("Working...".into()),
                tool_calls: vec![call("call_1", "store_contextual_data", r#"{"data":"x"}"#)],
                usage: Usage::default(),
            },
            ModelReply::text("Done!"),
        ]);
        let mut chat = session(provider);
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        let reply = chat.invoke_streaming("Test", tx).await.unwrap();
        assert_eq!(reply.text, "Done!");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        // RoundStart, Text, ToolCall, ToolResult, RoundStart, Text, Finished
        assert_eq!(events.len(), 7, "got {events:?}");
        assert!(matches!(events[0], ChatEvent::RoundStart { round: 0 }));
        assert!(matches!(events[1], ChatEvent::Text { .. }));
        assert!(matches!(events[2], ChatEvent::ToolCall { .. }));
        assert!(matches!(events[3], ChatEvent::ToolResult { .. }));
        assert!(matches!(events[4], ChatEvent::RoundStart { round: 1 }));
        assert!(matches!(events[5], ChatEvent::Text { .. }));
        assert!(matches!(events[6], ChatEvent::Finished { rounds: 2 }));

        // The assistant text that accompanied the call is kept with it.
        assert_eq!(chat.history()[1].text(), "Working...");
    }

    #[tokio::test]
    async fn rewind_through_session() {
        let (provider, _) =
            MockProvider::new(vec![ModelReply::text("a0"), ModelReply::text("a1")]);
        let mut chat = session(provider);
        chat.invoke("q0").await.unwrap();
        chat.invoke("q1").await.unwrap();

        assert!(matches!(chat.rewind(-1), Err(ChatError::InvalidArgument(_))));
        assert_eq!(chat.rewind(1).unwrap(), 2);
        assert_eq!(chat.formatted_history(), "Turn 0 - User: q0\nTurn 0 - llama3.2: a0");
    }

    #[tokio::test]
    async fn persistence_roundtrip_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (provider, _) = MockProvider::new(vec![
            ModelReply::tool_calls(vec![call(
                "call_1",
                "change_system_prompt",
                r#"{"sysPrompt":"Be verbose."}"#,
            )]),
            ModelReply::text("OK"),
        ]);
        let config = ChatConfig {
            model: "gemma3:12b".into(),
            user_name: "Ana".into(),
            max_history: 8,
            ..ChatConfig::default()
        };
        let mut chat = ChatSession::new(provider, "You are terse.", config);
        chat.invoke("hi").await.unwrap();

        let backup = chat.backup(dir.path(), Some("test")).await.unwrap();
        assert!(backup.join("chat.json").is_file());
        assert!(backup.join("params.json").is_file());

        let (provider, _) = MockProvider::new(vec![]);
        let mut restored = ChatSession::new(provider, "placeholder", ChatConfig::default());
        restored
            .deserialize_context(backup.join("chat.json"))
            .await
            .unwrap();
        restored
            .deserialize_params(backup.join("params.json"))
            .await
            .unwrap();

        assert_eq!(restored.history(), chat.history());
        assert_eq!(restored.system_prompt().await, "Be verbose.");
        assert_eq!(restored.config().model, "gemma3:12b");
        assert_eq!(restored.config().user_name, "Ana");
        assert_eq!(restored.config().max_history, 8);
    }

    #[tokio::test]
    async fn missing_context_file_is_typed() {
        let (provider, _) = MockProvider::new(vec![]);
        let mut chat = session(provider);
        let err = chat
            .deserialize_context("/no/such/chat.json")
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::NotFound { .. }));
    }
}
