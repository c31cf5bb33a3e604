//! Interactive chat client for a local Ollama server.
//!
//! # Usage
//!
//! ```bash
//! # Default model, prompts for a username
//! localchat
//!
//! # Pick a model and skip the username prompt
//! localchat --model llama3.2:1b --username alice
//!
//! # Wait for complete replies instead of streaming
//! localchat --no-stream
//! ```
//!
//! Lines starting with `/` or `--` are commands; `/help` lists them.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::error::ReadlineError;
use time::UtcOffset;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use localchat::chat::{
    Brain, ChatArgs, ChatConfig, ChatSession, ChatState, CommandRouter, Console, LineConsole,
    PlainTextRenderer, Spinner,
};
use localchat::{ChatBackend, Error, OllamaClient};

const FALLBACK_USERNAME: &str = "user";

fn main() -> ExitCode {
    // The local offset can only be read while the process is single-threaded.
    let utc_offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("localchat: could not start the async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(utc_offset)) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("localchat: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(utc_offset: UtcOffset) -> Result<u8, Error> {
    let (mut args, _) = ChatArgs::from_command_line_relaxed("localchat [OPTIONS]");
    let use_color = !args.no_color;
    let host = args.host.take();
    let username = args.username.take();
    let config = ChatConfig::try_from(args)?;

    let client = match host {
        Some(host) => OllamaClient::new(&host)?,
        None => OllamaClient::from_env()?,
    };
    let backend: Arc<dyn ChatBackend> = Arc::new(client);

    let router = CommandRouter::with_default_commands();
    let mut console = LineConsole::new(router.command_names(), use_color)?;
    let username = match username {
        Some(name) => name,
        None => match console.read_line("Enter your username: ") {
            Ok(name) => name,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => return Ok(0),
            Err(err) => return Err(err.into()),
        },
    };
    let username = match username.trim() {
        "" => FALLBACK_USERNAME.to_string(),
        name => name.to_string(),
    };

    let state = ChatState::new(username)
        .with_config(config)
        .with_utc_offset(utc_offset);
    let brain = Brain::new(&state, backend);
    let mut session = ChatSession::new(state, router, brain);
    let mut renderer = PlainTextRenderer::with_color(use_color);
    let mut spinner = Spinner::new("Bot is thinking");

    // Ctrl+C during a turn ends the loop once the turn completes.  Other
    // termination signals keep their default behavior.
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::Relaxed);
    }) {
        warn!(error = %err, "could not install the interrupt handler");
    }

    console.print_sys("Help: /help | Quit: /exit or :q");
    console.print_sys("Settings: /show_config | Change: /set <key> <value>");

    loop {
        let line = match console.read_line(&session.prompt()) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                console.print_sys(&format!("[Error] {}", Error::from(err)));
                break;
            }
        };

        if let std::ops::ControlFlow::Break(exit) = session
            .handle_line(&line, &mut console, &mut renderer, &mut spinner)
            .await
        {
            return Ok(exit.code);
        }
        if interrupted.swap(false, Ordering::Relaxed) {
            break;
        }
    }
    Ok(0)
}
