//! Configuration types for the chat application.
//!
//! This module provides CLI argument parsing via `arrrg`, the runtime
//! configuration that `/set` mutates, and the parsing rules for setting
//! values.

use std::fmt;
use std::str::FromStr;

use arrrg_derive::CommandLine;

use crate::error::{Error, Result};

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "llama3.2:3b";

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.6;

/// Command-line arguments for the localchat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct ChatArgs {
    /// Model to use for chat.
    #[arrrg(optional, "Model to use (default: llama3.2:3b)", "MODEL")]
    pub model: Option<String>,

    /// Sampling temperature.
    #[arrrg(optional, "Sampling temperature (default: 0.6)", "TEMP")]
    pub temperature: Option<String>,

    /// Username for the session; prompted for when absent.
    #[arrrg(optional, "Username for this session", "NAME")]
    pub username: Option<String>,

    /// Backend base URL.
    #[arrrg(optional, "Ollama base URL (default: $OLLAMA_HOST or http://localhost:11434)", "URL")]
    pub host: Option<String>,

    /// Wait for complete replies instead of streaming tokens.
    #[arrrg(flag, "Wait for complete replies instead of streaming")]
    pub no_stream: bool,

    /// Start with the web search tool enabled.
    #[arrrg(flag, "Enable web search (requires TAVILY_API_KEY)")]
    pub web: bool,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,
}

/// Runtime configuration of a chat session.
///
/// The set of fields is closed; `/set` addresses them through [`SettingKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Backend model identifier.  Not validated locally.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f32,

    /// Whether earlier turns are sent as context.
    pub use_memory: bool,

    /// Whether the web-search agent should be used when available.
    pub use_web: bool,

    /// Whether replies are streamed token by token.
    pub stream: bool,
}

impl ChatConfig {
    /// Creates a new ChatConfig with default values.
    ///
    /// Defaults:
    /// - Model: llama3.2:3b
    /// - Temperature: 0.6
    /// - Memory: on
    /// - Web: off
    /// - Stream: on
    pub fn new() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            use_memory: true,
            use_web: false,
            stream: true,
        }
    }

    /// Sets the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets whether earlier turns are sent as context.
    pub fn with_memory(mut self, use_memory: bool) -> Self {
        self.use_memory = use_memory;
        self
    }

    /// Sets whether the web-search agent is requested.
    pub fn with_web(mut self, use_web: bool) -> Self {
        self.use_web = use_web;
        self
    }

    /// Sets whether replies are streamed.
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Parses `value` for `key` and stores it.
    ///
    /// The configuration is untouched when the value does not parse.
    pub fn apply(&mut self, key: SettingKey, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            SettingKey::Model => {
                if value.is_empty() {
                    return Err(Error::validation(
                        "model requires a name, e.g. llama3.2:3b",
                        Some(key.to_string()),
                    ));
                }
                self.model = value.to_string();
            }
            SettingKey::Temperature => {
                self.temperature = value.parse::<f32>().map_err(|_| {
                    Error::validation(
                        "temp must be numeric, e.g. 0.6",
                        Some(key.to_string()),
                    )
                })?;
            }
            SettingKey::Memory => self.use_memory = parse_toggle(key, value)?,
            SettingKey::Web => self.use_web = parse_toggle(key, value)?,
            SettingKey::Stream => self.stream = parse_toggle(key, value)?,
        }
        Ok(())
    }

    /// The current value of `key`, formatted for display.
    pub fn display_value(&self, key: SettingKey) -> String {
        match key {
            SettingKey::Model => self.model.clone(),
            SettingKey::Temperature => self.temperature.to_string(),
            SettingKey::Memory => self.use_memory.to_string(),
            SettingKey::Web => self.use_web.to_string(),
            SettingKey::Stream => self.stream.to_string(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<ChatArgs> for ChatConfig {
    type Error = Error;

    fn try_from(args: ChatArgs) -> Result<Self> {
        let mut config = ChatConfig::new()
            .with_stream(!args.no_stream)
            .with_web(args.web);
        if let Some(model) = args.model {
            config.apply(SettingKey::Model, &model)?;
        }
        if let Some(temperature) = args.temperature {
            config.apply(SettingKey::Temperature, &temperature)?;
        }
        Ok(config)
    }
}

/// A key accepted by `/set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    /// `model`
    Model,
    /// `temp` or `temperature`
    Temperature,
    /// `memory`
    Memory,
    /// `web`
    Web,
    /// `stream`
    Stream,
}

impl FromStr for SettingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "model" => Ok(SettingKey::Model),
            "temp" | "temperature" => Ok(SettingKey::Temperature),
            "memory" => Ok(SettingKey::Memory),
            "web" => Ok(SettingKey::Web),
            "stream" => Ok(SettingKey::Stream),
            _ => Err(Error::validation(
                format!("unknown setting: {s}"),
                Some(s.to_string()),
            )),
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKey::Model => "model",
            SettingKey::Temperature => "temperature",
            SettingKey::Memory => "memory",
            SettingKey::Web => "web",
            SettingKey::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Parses an on/off token, case-insensitively.
pub fn parse_on_off(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_toggle(key: SettingKey, value: &str) -> Result<bool> {
    parse_on_off(value)
        .ok_or_else(|| Error::validation(format!("{key} on|off"), Some(key.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChatConfig::new();
        assert_eq!(config.model, "llama3.2:3b");
        assert_eq!(config.temperature, 0.6);
        assert!(config.use_memory);
        assert!(!config.use_web);
        assert!(config.stream);
    }

    #[test]
    fn config_from_args_defaults() {
        let config = ChatConfig::try_from(ChatArgs::default()).unwrap();
        assert_eq!(config, ChatConfig::default());
    }

    #[test]
    fn config_from_args_custom() {
        let args = ChatArgs {
            model: Some("llama3.2:1b".to_string()),
            temperature: Some("0.2".to_string()),
            no_stream: true,
            web: true,
            ..ChatArgs::default()
        };
        let config = ChatConfig::try_from(args).unwrap();
        assert_eq!(config.model, "llama3.2:1b");
        assert_eq!(config.temperature, 0.2);
        assert!(!config.stream);
        assert!(config.use_web);
    }

    #[test]
    fn config_from_args_rejects_bad_temperature() {
        let args = ChatArgs {
            temperature: Some("warm".to_string()),
            ..ChatArgs::default()
        };
        assert!(ChatConfig::try_from(args).unwrap_err().is_validation());
    }

    #[test]
    fn config_builder_pattern() {
        let config = ChatConfig::new()
            .with_model("qwen2.5:7b")
            .with_temperature(1.1)
            .with_memory(false)
            .with_web(true)
            .with_stream(false);
        assert_eq!(config.model, "qwen2.5:7b");
        assert_eq!(config.temperature, 1.1);
        assert!(!config.use_memory);
        assert!(config.use_web);
        assert!(!config.stream);
    }

    #[test]
    fn setting_keys_are_case_insensitive() {
        assert_eq!("MODEL".parse::<SettingKey>().unwrap(), SettingKey::Model);
        assert_eq!("Temp".parse::<SettingKey>().unwrap(), SettingKey::Temperature);
        assert_eq!(
            "temperature".parse::<SettingKey>().unwrap(),
            SettingKey::Temperature
        );
        assert!("volume".parse::<SettingKey>().is_err());
    }

    #[test]
    fn on_off_tokens() {
        for token in ["on", "TRUE", "1", "Yes"] {
            assert_eq!(parse_on_off(token), Some(true), "{token}");
        }
        for token in ["off", "False", "0", "NO"] {
            assert_eq!(parse_on_off(token), Some(false), "{token}");
        }
        assert_eq!(parse_on_off("maybe"), None);
        assert_eq!(parse_on_off(""), None);
    }

    #[test]
    fn failed_apply_leaves_config_untouched() {
        let mut config = ChatConfig::new();
        assert!(config.apply(SettingKey::Temperature, "abc").is_err());
        assert!(config.apply(SettingKey::Web, "sometimes").is_err());
        assert!(config.apply(SettingKey::Model, "  ").is_err());
        assert_eq!(config, ChatConfig::new());
    }

    #[test]
    fn apply_and_display() {
        let mut config = ChatConfig::new();
        config.apply(SettingKey::Temperature, "0.9").unwrap();
        config.apply(SettingKey::Stream, "off").unwrap();
        assert_eq!(config.display_value(SettingKey::Temperature), "0.9");
        assert_eq!(config.display_value(SettingKey::Stream), "false");
    }
}
