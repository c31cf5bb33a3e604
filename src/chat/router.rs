//! Command routing for the chat application.
//!
//! Lines that start with `/` or `--` are administrative commands, as are lines
//! whose first word is a `:` alias such as `:q`.  They are split with shell
//! quoting rules, the first token is resolved through the alias table, and the
//! matching handler runs.  Every other line is a chat turn and is left to the
//! caller.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use tracing::debug;

use crate::chat::brain::Brain;
use crate::chat::commands;
use crate::chat::render::Console;
use crate::chat::state::ChatState;
use crate::error::{Error, Result};

/// Prefixes that mark a line as a command.
pub const COMMAND_PREFIXES: [&str; 2] = ["/", "--"];

/// Leading character of aliases that are routed without a command prefix.
const SHORT_ALIAS_PREFIX: char = ':';

/// Request to leave the chat loop with an exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRequest {
    /// Process exit status.
    pub code: u8,
}

/// Everything a command handler may touch.
pub struct CommandContext<'a> {
    /// Conversation state.
    pub state: &'a mut ChatState,
    /// Administrative console.
    pub console: &'a mut dyn Console,
    /// Orchestrator, rebuilt after settings change.
    pub brain: &'a mut Brain,
}

/// A command handler.  `Break` asks the loop to exit.
pub type CommandHandler = fn(&mut CommandContext<'_>, &[String]) -> ControlFlow<ExitRequest>;

/// Table of commands and aliases.
#[derive(Default)]
pub struct CommandRouter {
    handlers: BTreeMap<String, CommandHandler>,
    aliases: BTreeMap<String, String>,
}

impl CommandRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a router with the built-in commands and aliases.
    pub fn with_default_commands() -> Self {
        let mut router = Self::new();
        router.register("/help", commands::help);
        router.register("/log", commands::log);
        router.register("/exit", commands::exit);
        router.register("--username", commands::show_username);
        router.register("--change_username", commands::change_username);
        router.register("/set", commands::set);
        router.register("/show_config", commands::show_config);
        router.add_alias(":q", "/exit");
        router.add_alias("exit", "/exit");
        router.add_alias("help", "/help");
        router
    }

    /// Registers `handler` under `command`.  A later registration replaces an
    /// earlier one.
    pub fn register(&mut self, command: impl Into<String>, handler: CommandHandler) {
        self.handlers.insert(command.into(), handler);
    }

    /// Makes `alias` resolve to `target`.  The target is not checked until
    /// dispatch.
    pub fn add_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    /// Canonical command tokens followed by aliases, for completion.
    pub fn command_names(&self) -> Vec<String> {
        self.handlers
            .keys()
            .chain(self.aliases.keys())
            .cloned()
            .collect()
    }

    /// True when `line` would be offered to a handler.
    ///
    /// A `:` line only qualifies when its first word is a registered alias;
    /// anything else, like `:) thanks`, is a chat turn.
    pub fn is_command(&self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }
        if COMMAND_PREFIXES.iter().any(|p| line.starts_with(p)) {
            return true;
        }
        line.starts_with(SHORT_ALIAS_PREFIX)
            && line
                .split_whitespace()
                .next()
                .is_some_and(|word| self.aliases.contains_key(word))
    }

    /// Resolves `token` through the alias table to its handler.
    pub fn resolve(&self, token: &str) -> Result<CommandHandler> {
        let canonical = self.aliases.get(token).map(String::as_str).unwrap_or(token);
        if canonical != token {
            debug!(alias = token, command = canonical, "alias applied");
        }
        self.handlers
            .get(canonical)
            .copied()
            .ok_or_else(|| Error::unknown_command(canonical))
    }

    /// Offers `line` to the command table.
    ///
    /// Returns `Continue(false)` when the line is a chat turn and
    /// `Continue(true)` when it was consumed, including unknown commands.
    /// `Break` carries an exit request from a handler.
    pub fn dispatch(
        &self,
        line: &str,
        ctx: &mut CommandContext<'_>,
    ) -> ControlFlow<ExitRequest, bool> {
        if !self.is_command(line) {
            return ControlFlow::Continue(false);
        }

        let parts = match shell_words::split(line) {
            Ok(parts) => parts,
            Err(err) => {
                ctx.console.print_sys(&format!("Could not parse command: {err}"));
                return ControlFlow::Continue(true);
            }
        };
        let Some((token, args)) = parts.split_first() else {
            return ControlFlow::Continue(false);
        };

        match self.resolve(token) {
            Ok(handler) => {
                debug!(command = token.as_str(), args = args.len(), "dispatching command");
                handler(ctx, args)?;
            }
            Err(err) => {
                debug!(error = %err, "unknown command");
                ctx.console.print_sys(&err.to_string());
            }
        }
        ControlFlow::Continue(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    use rustyline::error::ReadlineError;

    use crate::client::{ChatBackend, TokenStream};
    use crate::types::ChatRequest;

    struct NoBackend;

    #[async_trait::async_trait]
    impl ChatBackend for NoBackend {
        async fn chat(&self, _: ChatRequest) -> Result<String> {
            Err(Error::connection("no backend", None))
        }

        async fn chat_stream(&self, _: ChatRequest) -> Result<TokenStream> {
            Err(Error::connection("no backend", None))
        }
    }

    #[derive(Default)]
    struct ScriptedConsole {
        printed: Vec<String>,
        input: VecDeque<String>,
    }

    impl Console for ScriptedConsole {
        fn print_sys(&mut self, text: &str) {
            self.printed.push(text.to_string());
        }

        fn read_line(&mut self, _prompt: &str) -> std::result::Result<String, ReadlineError> {
            self.input.pop_front().ok_or(ReadlineError::Eof)
        }
    }

    fn run(router: &CommandRouter, line: &str) -> (ControlFlow<ExitRequest, bool>, Vec<String>) {
        let mut state = ChatState::new("alice");
        let mut console = ScriptedConsole::default();
        let mut brain = Brain::with_web_tool(&state, Arc::new(NoBackend), None);
        let mut ctx = CommandContext {
            state: &mut state,
            console: &mut console,
            brain: &mut brain,
        };
        let flow = router.dispatch(line, &mut ctx);
        (flow, console.printed)
    }

    fn noop(_: &mut CommandContext<'_>, _: &[String]) -> ControlFlow<ExitRequest> {
        ControlFlow::Continue(())
    }

    fn first(ctx: &mut CommandContext<'_>, _: &[String]) -> ControlFlow<ExitRequest> {
        ctx.console.print_sys("first");
        ControlFlow::Continue(())
    }

    fn second(ctx: &mut CommandContext<'_>, args: &[String]) -> ControlFlow<ExitRequest> {
        ctx.console.print_sys(&format!("second {}", args.join("|")));
        ControlFlow::Continue(())
    }

    #[test]
    fn plain_lines_are_not_routed() {
        let router = CommandRouter::with_default_commands();
        for line in ["", "hello", "exit", "help", " /help", "-x"] {
            let (flow, printed) = run(&router, line);
            assert_eq!(flow, ControlFlow::Continue(false), "{line:?}");
            assert!(printed.is_empty());
        }
    }

    #[test]
    fn colon_lines_are_chat_unless_aliased() {
        let router = CommandRouter::with_default_commands();
        for line in [":) hi", ":D", ":q!", ":quit now"] {
            let (flow, printed) = run(&router, line);
            assert_eq!(flow, ControlFlow::Continue(false), "{line:?}");
            assert!(printed.is_empty());
        }
        assert!(router.is_command(":q"));
        assert!(router.is_command(":q later"));
        assert!(!CommandRouter::new().is_command(":q"));
    }

    #[test]
    fn unknown_commands_are_consumed() {
        let router = CommandRouter::with_default_commands();
        let (flow, printed) = run(&router, "/frobnicate now");
        assert_eq!(flow, ControlFlow::Continue(true));
        assert_eq!(printed, vec!["Unknown command: /frobnicate"]);
    }

    #[test]
    fn alias_matches_canonical_exit() {
        let router = CommandRouter::with_default_commands();
        let (alias_flow, alias_out) = run(&router, ":q");
        let (exit_flow, exit_out) = run(&router, "/exit");
        assert_eq!(alias_flow, ControlFlow::Break(ExitRequest { code: 0 }));
        assert_eq!(alias_flow, exit_flow);
        assert_eq!(alias_out, exit_out);
    }

    #[test]
    fn dangling_alias_fails_at_dispatch() {
        let mut router = CommandRouter::new();
        router.add_alias("/gone", "/missing");
        assert!(router.resolve("/gone").unwrap_err().is_unknown_command());
        let (flow, printed) = run(&router, "/gone");
        assert_eq!(flow, ControlFlow::Continue(true));
        assert_eq!(printed, vec!["Unknown command: /missing"]);
    }

    #[test]
    fn last_registration_wins() {
        let mut router = CommandRouter::new();
        router.register("/x", first);
        router.register("/x", second);
        let (_, printed) = run(&router, "/x a");
        assert_eq!(printed, vec!["second a"]);
    }

    #[test]
    fn quoted_arguments_stay_together() {
        let mut router = CommandRouter::new();
        router.register("/x", second);
        let (_, printed) = run(&router, "/x \"two words\" three");
        assert_eq!(printed, vec!["second two words|three"]);
    }

    #[test]
    fn unbalanced_quotes_are_reported() {
        let mut router = CommandRouter::new();
        router.register("/x", noop);
        let (flow, printed) = run(&router, "/x \"open");
        assert_eq!(flow, ControlFlow::Continue(true));
        assert_eq!(printed.len(), 1);
        assert!(printed[0].starts_with("Could not parse command"));
    }

    #[test]
    fn command_names_include_aliases() {
        let names = CommandRouter::with_default_commands().command_names();
        for name in ["/help", "/log", "/exit", "--username", "--change_username", "/set", "/show_config", ":q"] {
            assert!(names.iter().any(|n| n == name), "{name}");
        }
    }
}
