//! One interactive chat session: routing, turn execution and bookkeeping.

use std::ops::ControlFlow;

use tracing::warn;

use crate::chat::brain::Brain;
use crate::chat::render::{Console, Renderer};
use crate::chat::router::{CommandContext, CommandRouter, ExitRequest};
use crate::chat::spinner::Indicator;
use crate::chat::state::ChatState;
use crate::error::Result;
use crate::types::Role;

/// Ties conversation state, the command table and the orchestrator together.
pub struct ChatSession {
    state: ChatState,
    router: CommandRouter,
    brain: Brain,
}

impl ChatSession {
    /// Creates a session from its parts.
    pub fn new(state: ChatState, router: CommandRouter, brain: Brain) -> Self {
        Self {
            state,
            router,
            brain,
        }
    }

    /// Conversation state.
    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// The orchestrator.
    pub fn brain(&self) -> &Brain {
        &self.brain
    }

    /// The command table.
    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Prompt shown before each line.
    pub fn prompt(&self) -> String {
        format!("{} > ", self.state.username)
    }

    /// Handles one line of input.
    ///
    /// Commands are dispatched; anything else is a chat turn.  Turn failures
    /// are reported on `console` and never end the session.
    pub async fn handle_line(
        &mut self,
        line: &str,
        console: &mut dyn Console,
        renderer: &mut dyn Renderer,
        indicator: &mut dyn Indicator,
    ) -> ControlFlow<ExitRequest> {
        let line = line.trim();
        if line.is_empty() {
            return ControlFlow::Continue(());
        }

        let mut ctx = CommandContext {
            state: &mut self.state,
            console: &mut *console,
            brain: &mut self.brain,
        };
        if self.router.dispatch(line, &mut ctx)? {
            return ControlFlow::Continue(());
        }

        self.state.append_message(Role::User, line);
        match self.run_turn(line, renderer, indicator).await {
            Ok(reply) => self.state.append_message(Role::Assistant, reply),
            Err(err) => {
                warn!(error = %err, "turn failed");
                console.print_sys(&format!("[Error] {err}"));
            }
        }
        ControlFlow::Continue(())
    }

    async fn run_turn(
        &mut self,
        line: &str,
        renderer: &mut dyn Renderer,
        indicator: &mut dyn Indicator,
    ) -> Result<String> {
        indicator.start();
        let result = if self.state.config.stream {
            let observed: &mut dyn Indicator = &mut *indicator;
            self.brain
                .generate_stream(&self.state, line, renderer, Some(observed))
                .await
        } else {
            self.brain.generate_sync(&self.state, line).await
        };
        indicator.stop();

        if !self.state.config.stream
            && let Ok(reply) = &result
        {
            renderer.print_header();
            renderer.print_text(reply);
            renderer.finish_response();
        }
        result
    }
}
