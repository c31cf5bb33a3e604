//! Interactive chat application over a local Ollama server.
//!
//! # Architecture
//!
//! - [`state`]: username, message log and runtime configuration
//! - [`config`]: CLI arguments, [`ChatConfig`] and `/set` value parsing
//! - [`router`]: command table, aliases and dispatch
//! - [`commands`]: the built-in command handlers
//! - [`brain`]: pipeline selection, per-session history and turn execution
//! - [`agent`]: the tool-using reason-and-act pipeline and web search
//! - [`render`]: line reader, system notices and the reply sink
//! - [`spinner`]: the working indicator
//! - [`session`]: one line in, one turn or command out

pub mod agent;
pub mod brain;
pub mod commands;
pub mod config;
pub mod render;
pub mod router;
pub mod session;
pub mod spinner;
pub mod state;

pub use agent::{AgentPipeline, AgentStep, TavilySearch, Tool, parse_step};
pub use brain::{Brain, ChatModel, ChatPipeline, HistoryEntry, Pipeline, PipelineKind, SessionId};
pub use commands::help_text;
pub use config::{ChatArgs, ChatConfig, SettingKey, parse_on_off};
pub use render::{Console, LineConsole, PlainTextRenderer, Renderer};
pub use router::{CommandContext, CommandHandler, CommandRouter, ExitRequest};
pub use session::ChatSession;
pub use spinner::{Indicator, Spinner};
pub use state::{ChatMessage, ChatState, MessageContent};
