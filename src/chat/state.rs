//! Conversation state for one interactive session.

use time::{OffsetDateTime, UtcOffset};
use time::macros::format_description;

use crate::chat::config::ChatConfig;
use crate::types::{Role, WireMessage};

/// Body of a logged message.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// A structured reply as returned by the backend.
    Reply(WireMessage),
}

impl MessageContent {
    /// The displayable text, unwrapping structured replies.
    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Reply(message) => &message.content,
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<WireMessage> for MessageContent {
    fn from(message: WireMessage) -> Self {
        MessageContent::Reply(message)
    }
}

/// One entry of the conversation log.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatMessage {
    /// Who wrote the message.
    pub role: Role,
    /// What was written.
    pub content: MessageContent,
    /// When the message was appended.
    pub timestamp: OffsetDateTime,
}

impl ChatMessage {
    /// Wall-clock time of the message as `HH:MM:SS`.
    pub fn clock_time(&self) -> String {
        self.timestamp
            .format(format_description!("[hour]:[minute]:[second]"))
            .unwrap_or_else(|_| self.timestamp.to_string())
    }
}

/// Username, append-only message log and configuration of a session.
#[derive(Clone, Debug)]
pub struct ChatState {
    /// Display name; also selects the backend history thread.
    pub username: String,
    /// Runtime configuration.
    pub config: ChatConfig,
    messages: Vec<ChatMessage>,
    utc_offset: UtcOffset,
}

impl ChatState {
    /// Creates a state with the default configuration.
    ///
    /// Timestamps use the local offset if it can be determined here, else
    /// UTC.  Processes that start threads should pass the offset in through
    /// [`ChatState::with_utc_offset`], since it cannot be read once more than
    /// one thread is running.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            config: ChatConfig::default(),
            messages: Vec::new(),
            utc_offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Stamps messages with `offset` instead of the detected one.
    pub fn with_utc_offset(mut self, offset: UtcOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    /// The offset messages are stamped with.
    pub fn utc_offset(&self) -> UtcOffset {
        self.utc_offset
    }

    /// Appends a message stamped with the current time at the session offset.
    pub fn append_message(&mut self, role: Role, content: impl Into<MessageContent>) {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
            timestamp: OffsetDateTime::now_utc().to_offset(self.utc_offset),
        });
    }

    /// The log in insertion order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of logged messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}
