//! Session orchestrator.
//!
//! The [`Brain`] turns the current [`ChatConfig`](crate::chat::ChatConfig)
//! into a runnable pipeline and executes turns against it.  The pipeline is a
//! snapshot: it only changes when [`Brain::rebuild`] is called.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tracing::debug;

use crate::chat::agent::{AgentPipeline, TavilySearch, Tool};
use crate::chat::render::Renderer;
use crate::chat::spinner::Indicator;
use crate::chat::state::ChatState;
use crate::client::{ChatBackend, TokenStream};
use crate::error::Result;
use crate::observability::{BRAIN_REBUILDS, BRAIN_TURN_ERRORS, BRAIN_TURNS};
use crate::types::{ChatOptions, ChatRequest, Role, WireMessage, to_backend_messages};

/// Preamble of the plain chat pipeline.
pub const SYSTEM_PREAMBLE: &str = "You are a helpful AI assistant.";

///////////////////////////////////////////// SessionId /////////////////////////////////////////////

/// Key of a history thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// The session of `username`; blank names share the `default` session.
    pub fn from_username(username: &str) -> Self {
        let username = username.trim();
        if username.is_empty() {
            SessionId("default".to_string())
        } else {
            SessionId(username.to_string())
        }
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message of a history thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Author of the message.
    pub role: Role,
    /// Message text.
    pub content: String,
}

///////////////////////////////////////////// ChatModel /////////////////////////////////////////////

/// A backend bound to a model and its generation options.
#[derive(Clone)]
pub struct ChatModel {
    backend: Arc<dyn ChatBackend>,
    model: String,
    temperature: f32,
}

impl ChatModel {
    /// Binds `backend` to `model` at `temperature`.
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature,
        }
    }

    /// The model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn request(&self, messages: Vec<WireMessage>, stop: Option<Vec<String>>) -> ChatRequest {
        ChatRequest::new(self.model.clone(), messages).with_options(ChatOptions {
            temperature: Some(self.temperature),
            stop,
        })
    }

    /// Blocking call.
    pub async fn invoke(&self, messages: Vec<WireMessage>) -> Result<String> {
        self.backend.chat(self.request(messages, None)).await
    }

    /// Blocking call that ends generation at any of `stop`.
    pub async fn invoke_with_stop(
        &self,
        messages: Vec<WireMessage>,
        stop: Vec<String>,
    ) -> Result<String> {
        self.backend.chat(self.request(messages, Some(stop))).await
    }

    /// Streaming call.
    pub async fn stream(&self, messages: Vec<WireMessage>) -> Result<TokenStream> {
        let mut request = self.request(messages, None);
        request.stream = true;
        self.backend.chat_stream(request).await
    }
}

//////////////////////////////////////////// ChatPipeline ////////////////////////////////////////////

/// Fixed preamble, prior turns, then the current input.
#[derive(Clone)]
pub struct ChatPipeline {
    model: ChatModel,
    preamble: String,
}

impl ChatPipeline {
    /// Creates a plain chat pipeline with the default preamble.
    pub fn new(model: ChatModel) -> Self {
        Self {
            model,
            preamble: SYSTEM_PREAMBLE.to_string(),
        }
    }

    fn messages(&self, history: &[HistoryEntry], input: &str) -> Vec<WireMessage> {
        to_backend_messages(
            history
                .iter()
                .map(|h| (h.role, h.content.as_str()))
                .chain(std::iter::once((Role::User, input))),
            Some(&self.preamble),
        )
    }

    /// Produces the full reply.
    pub async fn generate(&self, history: &[HistoryEntry], input: &str) -> Result<String> {
        self.model.invoke(self.messages(history, input)).await
    }

    /// Produces the reply as a stream of pieces.
    pub async fn stream(&self, history: &[HistoryEntry], input: &str) -> Result<TokenStream> {
        self.model.stream(self.messages(history, input)).await
    }
}

////////////////////////////////////////////// Pipeline //////////////////////////////////////////////

/// Which kind of pipeline is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    /// Plain chat.
    PlainChat,
    /// Reason-and-act agent with tools.
    ToolAgent,
}

/// The active execution pipeline.
pub enum Pipeline {
    /// Plain chat.
    PlainChat(ChatPipeline),
    /// Reason-and-act agent with tools.
    ToolAgent(AgentPipeline),
}

impl Pipeline {
    /// The variant tag.
    pub fn kind(&self) -> PipelineKind {
        match self {
            Pipeline::PlainChat(_) => PipelineKind::PlainChat,
            Pipeline::ToolAgent(_) => PipelineKind::ToolAgent,
        }
    }

    /// Produces the full reply for `input`.
    pub async fn generate(&self, history: &[HistoryEntry], input: &str) -> Result<String> {
        match self {
            Pipeline::PlainChat(chat) => chat.generate(history, input).await,
            Pipeline::ToolAgent(agent) => agent.generate(history, input).await,
        }
    }
}

/////////////////////////////////////////////// Brain ///////////////////////////////////////////////

/// Binds configuration to a pipeline and keeps per-session history.
pub struct Brain {
    backend: Arc<dyn ChatBackend>,
    web_tool: Option<Arc<dyn Tool>>,
    model: ChatModel,
    tools: Vec<Arc<dyn Tool>>,
    pipeline: Pipeline,
    use_memory: bool,
    history: HashMap<SessionId, Vec<HistoryEntry>>,
    rebuilds: u64,
}

impl Brain {
    /// Creates a brain whose web tool is Tavily search when `TAVILY_API_KEY`
    /// is set.
    pub fn new(state: &ChatState, backend: Arc<dyn ChatBackend>) -> Self {
        let web_tool = TavilySearch::from_env().map(|t| Arc::new(t) as Arc<dyn Tool>);
        Self::with_web_tool(state, backend, web_tool)
    }

    /// Creates a brain with an explicit web tool; `None` means web search is
    /// unavailable.
    pub fn with_web_tool(
        state: &ChatState,
        backend: Arc<dyn ChatBackend>,
        web_tool: Option<Arc<dyn Tool>>,
    ) -> Self {
        let model = ChatModel::new(
            Arc::clone(&backend),
            state.config.model.clone(),
            state.config.temperature,
        );
        let mut brain = Self {
            backend,
            web_tool,
            pipeline: Pipeline::PlainChat(ChatPipeline::new(model.clone())),
            model,
            tools: Vec::new(),
            use_memory: state.config.use_memory,
            history: HashMap::new(),
            rebuilds: 0,
        };
        brain.rebuild(state);
        brain
    }

    /// Reconstructs the model binding, tool set and pipeline from
    /// `state.config`.
    pub fn rebuild(&mut self, state: &ChatState) {
        let config = &state.config;
        self.model = ChatModel::new(
            Arc::clone(&self.backend),
            config.model.clone(),
            config.temperature,
        );

        self.tools.clear();
        if config.use_web
            && let Some(tool) = &self.web_tool
        {
            self.tools.push(Arc::clone(tool));
        }

        self.pipeline = if config.use_web && !self.tools.is_empty() {
            Pipeline::ToolAgent(AgentPipeline::new(self.model.clone(), self.tools.clone()))
        } else {
            Pipeline::PlainChat(ChatPipeline::new(self.model.clone()))
        };
        self.use_memory = config.use_memory;
        self.rebuilds += 1;
        BRAIN_REBUILDS.click();
        debug!(
            model = %config.model,
            temperature = config.temperature,
            tools = self.tools.len(),
            pipeline = ?self.pipeline.kind(),
            "rebuilt pipeline"
        );
    }

    /// Number of rebuilds since construction, including the initial one.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// The active pipeline variant.
    pub fn pipeline_kind(&self) -> PipelineKind {
        self.pipeline.kind()
    }

    /// The bound model.
    pub fn model(&self) -> &ChatModel {
        &self.model
    }

    /// Names of the tools in the current tool set.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// The history thread of `session`; empty when none exists yet.
    pub fn history(&self, session: &SessionId) -> &[HistoryEntry] {
        self.history.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Produces a complete reply for `line` in the session of `state.username`.
    pub async fn generate_sync(&mut self, state: &ChatState, line: &str) -> Result<String> {
        let session = self.open_session(state);
        BRAIN_TURNS.click();
        let result = {
            let history = self.context(&session);
            self.pipeline.generate(history, line).await
        };
        self.finish_turn(session, line, result)
    }

    /// Produces a reply for `line`, writing it to `sink` as it arrives.
    ///
    /// `indicator` is stopped before the first piece is written.  The full
    /// reply is returned once generation ends.
    pub async fn generate_stream(
        &mut self,
        state: &ChatState,
        line: &str,
        sink: &mut dyn Renderer,
        indicator: Option<&mut dyn Indicator>,
    ) -> Result<String> {
        let session = self.open_session(state);
        BRAIN_TURNS.click();
        let mut observer = StreamObserver::new(sink, indicator);
        let result = {
            let history = self.context(&session);
            match &self.pipeline {
                Pipeline::PlainChat(chat) => match chat.stream(history, line).await {
                    Ok(stream) => observer.consume(stream).await,
                    Err(err) => Err(err),
                },
                Pipeline::ToolAgent(agent) => agent.generate(history, line).await.map(|answer| {
                    observer.on_token(&answer);
                    answer
                }),
            }
        };
        observer.on_end();
        self.finish_turn(session, line, result)
    }

    fn open_session(&mut self, state: &ChatState) -> SessionId {
        let session = SessionId::from_username(&state.username);
        self.history.entry(session.clone()).or_default();
        session
    }

    fn context(&self, session: &SessionId) -> &[HistoryEntry] {
        if self.use_memory {
            self.history(session)
        } else {
            &[]
        }
    }

    fn finish_turn(
        &mut self,
        session: SessionId,
        line: &str,
        result: Result<String>,
    ) -> Result<String> {
        match result {
            Ok(reply) => {
                let thread = self.history.entry(session).or_default();
                thread.push(HistoryEntry {
                    role: Role::User,
                    content: line.to_string(),
                });
                thread.push(HistoryEntry {
                    role: Role::Assistant,
                    content: reply.clone(),
                });
                Ok(reply)
            }
            Err(err) => {
                BRAIN_TURN_ERRORS.click();
                debug!(session = %session, error = %err, "turn failed");
                Err(err)
            }
        }
    }
}

/////////////////////////////////////////// StreamObserver ///////////////////////////////////////////

/// Writes streamed pieces to a sink.
///
/// The header is written once, before the first piece, and the indicator is
/// stopped before that.  A line break is written once at the end if anything
/// was written.
struct StreamObserver<'s, 'i> {
    sink: &'s mut dyn Renderer,
    indicator: Option<&'i mut dyn Indicator>,
    started: bool,
    ended: bool,
}

impl<'s, 'i> StreamObserver<'s, 'i> {
    fn new(sink: &'s mut dyn Renderer, indicator: Option<&'i mut dyn Indicator>) -> Self {
        Self {
            sink,
            indicator,
            started: false,
            ended: false,
        }
    }

    fn on_token(&mut self, token: &str) {
        if !self.started {
            if let Some(indicator) = self.indicator.as_deref_mut()
                && indicator.is_running()
            {
                indicator.stop();
            }
            self.sink.print_header();
            self.started = true;
        }
        self.sink.print_text(token);
    }

    async fn consume(&mut self, mut stream: TokenStream) -> Result<String> {
        let mut reply = String::new();
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            self.on_token(&piece);
            reply.push_str(&piece);
        }
        Ok(reply)
    }

    fn on_end(&mut self) {
        if self.started && !self.ended {
            self.sink.finish_response();
        }
        self.ended = true;
    }
}
