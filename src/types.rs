//! Wire and conversation types shared by the client and the chat application.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The author of a message in a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Text typed by the person at the terminal.
    User,
    /// A reply produced by the model.
    Assistant,
    /// A preamble or notice that frames the conversation.
    System,
}

impl Role {
    /// The role name the backend expects on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "bot"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A single message as sent to and received from the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Backend role name (`system`, `user` or `assistant`).
    pub role: String,
    /// Message text.
    pub content: String,
}

impl WireMessage {
    /// Creates a wire message for `role` carrying `content`.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role: role.wire_name().to_string(),
            content: content.into(),
        }
    }
}

/// Generation options forwarded to the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChatOptions {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Sequences that end generation when produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl ChatOptions {
    /// True when no option would be serialized.
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.stop.is_none()
    }
}

/// Body of a chat-completion request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChatRequest {
    /// Model identifier, e.g. `llama3.2:3b`.
    pub model: String,
    /// Ordered conversation context, system preamble first.
    pub messages: Vec<WireMessage>,
    /// Whether the backend should answer with newline-delimited chunks.
    pub stream: bool,
    /// Optional generation options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<ChatOptions>,
}

impl ChatRequest {
    /// Creates a blocking request with no options.
    pub fn new(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            options: None,
        }
    }

    /// Attaches generation options; empty options are dropped.
    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = if options.is_empty() {
            None
        } else {
            Some(options)
        };
        self
    }
}

/// Translates conversation messages into backend messages.
///
/// The optional `system` preamble is prepended as the first message and
/// internal roles are renamed to the names the backend expects.
pub fn to_backend_messages<'a, I>(messages: I, system: Option<&str>) -> Vec<WireMessage>
where
    I: IntoIterator<Item = (Role, &'a str)>,
{
    let mut out = Vec::new();
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        out.push(WireMessage::new(Role::System, system));
    }
    for (role, content) in messages {
        out.push(WireMessage::new(role, content));
    }
    out
}
