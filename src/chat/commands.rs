//! Built-in command handlers.
//!
//! Handlers only mutate conversation state and print through the console.
//! `/set` additionally rebuilds the orchestrator so the change takes effect
//! on the next turn.

use std::ops::ControlFlow;

use crate::chat::config::SettingKey;
use crate::chat::router::{CommandContext, ExitRequest};
use crate::error::Error;

const ALL_SETTINGS: [SettingKey; 5] = [
    SettingKey::Model,
    SettingKey::Temperature,
    SettingKey::Memory,
    SettingKey::Web,
    SettingKey::Stream,
];

/// Returns the help text listing the available commands.
pub fn help_text() -> &'static str {
    r#"Commands:
  /help                 Show this help
  /log [--last N]       Show the message log
  /exit (alias: :q)     Quit
  --username            Show the current username
  --change_username X   Change the username (asks when X is missing)
  /set <key> <value>    Change a setting: model, temp, memory, web, stream
  /show_config          Show the current settings"#
}

/// `/help`
pub fn help(ctx: &mut CommandContext<'_>, _args: &[String]) -> ControlFlow<ExitRequest> {
    for line in help_text().lines() {
        ctx.console.print_sys(line);
    }
    ControlFlow::Continue(())
}

/// `/log [--last N]`
pub fn log(ctx: &mut CommandContext<'_>, args: &[String]) -> ControlFlow<ExitRequest> {
    let last = match parse_log_args(args) {
        Ok(last) => last,
        Err(err) => {
            ctx.console.print_sys(&hint(&err));
            return ControlFlow::Continue(());
        }
    };
    let messages = ctx.state.messages();
    let skip = last.map_or(0, |n| messages.len().saturating_sub(n));
    let lines: Vec<String> = messages[skip..]
        .iter()
        .map(|m| format!("  [{}] {}: {}", m.clock_time(), m.role, m.content.text()))
        .collect();

    ctx.console.print_sys("Message log:");
    for line in &lines {
        ctx.console.print_sys(line);
    }
    ControlFlow::Continue(())
}

fn parse_log_args(args: &[String]) -> Result<Option<usize>, Error> {
    match args {
        [] => Ok(None),
        [flag, n] if flag == "--last" => n.parse::<usize>().map(Some).map_err(|_| {
            Error::validation(
                "--last needs a whole number, e.g. /log --last 5",
                Some("--last".to_string()),
            )
        }),
        _ => Err(Error::validation("usage: /log [--last N]", None)),
    }
}

/// `/exit`
pub fn exit(ctx: &mut CommandContext<'_>, _args: &[String]) -> ControlFlow<ExitRequest> {
    ctx.console.print_sys("Goodbye!");
    ControlFlow::Break(ExitRequest { code: 0 })
}

/// `--username`
pub fn show_username(ctx: &mut CommandContext<'_>, _args: &[String]) -> ControlFlow<ExitRequest> {
    let text = format!("Username: {}", ctx.state.username);
    ctx.console.print_sys(&text);
    ControlFlow::Continue(())
}

/// `--change_username [name]`
pub fn change_username(ctx: &mut CommandContext<'_>, args: &[String]) -> ControlFlow<ExitRequest> {
    let new_name = if args.is_empty() {
        match ctx.console.read_line("New username > ") {
            Ok(line) => line.trim().to_string(),
            Err(err) => {
                let err = Error::from(err);
                ctx.console.print_sys(&format!("Warning: {err}"));
                return ControlFlow::Continue(());
            }
        }
    } else {
        args.join(" ").trim().to_string()
    };

    if new_name.is_empty() {
        ctx.console.print_sys("Warning: empty username rejected.");
        return ControlFlow::Continue(());
    }
    let old = std::mem::replace(&mut ctx.state.username, new_name);
    let text = format!("Username changed: {old} → {}", ctx.state.username);
    ctx.console.print_sys(&text);
    ControlFlow::Continue(())
}

/// `/set <key> <value>`
pub fn set(ctx: &mut CommandContext<'_>, args: &[String]) -> ControlFlow<ExitRequest> {
    if args.len() < 2 {
        ctx.console
            .print_sys("Usage: /set <model|temp|memory|web|stream> <value>");
        return ControlFlow::Continue(());
    }
    let key = match args[0].parse::<SettingKey>() {
        Ok(key) => key,
        Err(_) => {
            let text = format!("Unknown setting: {}", args[0].to_lowercase());
            ctx.console.print_sys(&text);
            return ControlFlow::Continue(());
        }
    };
    let value = args[1..].join(" ");
    if let Err(err) = ctx.state.config.apply(key, &value) {
        ctx.console.print_sys(&hint(&err));
        return ControlFlow::Continue(());
    }

    ctx.brain.rebuild(ctx.state);
    let text = format!("Updated: {key} = {}", ctx.state.config.display_value(key));
    ctx.console.print_sys(&text);
    ControlFlow::Continue(())
}

/// `/show_config`
pub fn show_config(ctx: &mut CommandContext<'_>, _args: &[String]) -> ControlFlow<ExitRequest> {
    let config = &ctx.state.config;
    let lines: Vec<String> = ALL_SETTINGS
        .iter()
        .map(|&key| format!("  {} : {}", field_name(key), config.display_value(key)))
        .collect();
    ctx.console.print_sys("Settings:");
    for line in &lines {
        ctx.console.print_sys(line);
    }
    ControlFlow::Continue(())
}

fn field_name(key: SettingKey) -> &'static str {
    match key {
        SettingKey::Model => "model",
        SettingKey::Temperature => "temperature",
        SettingKey::Memory => "use_memory",
        SettingKey::Web => "use_web",
        SettingKey::Stream => "stream",
    }
}

fn hint(err: &Error) -> String {
    match err {
        Error::Validation { message, .. } => format!("Error: {message}"),
        other => format!("Error: {other}"),
    }
}
