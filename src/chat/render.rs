//! Terminal input and output for the chat application.
//!
//! [`Console`] is the administrative surface: it reads lines and prints
//! system notices.  [`Renderer`] is the sink assistant replies are written
//! to, either piece by piece while streaming or all at once.

use std::io::{self, Stdout, Write};

use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};

/// ANSI escape code for dim text (used for system notices).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the reply header).
const ANSI_CYAN: &str = "\x1b[36m";

/// Prefix for system notices.
pub const SYSTEM_PREFIX: &str = "System > ";

/// Header written once before a reply.
pub const REPLY_HEADER: &str = "Bot  > ";

//////////////////////////////////////////////// Console ////////////////////////////////////////////////

/// Line-oriented administrative console.
pub trait Console {
    /// Print a system notice on its own line.
    fn print_sys(&mut self, text: &str);

    /// Read one line of input after showing `prompt`.
    fn read_line(&mut self, prompt: &str) -> Result<String, ReadlineError>;
}

/// Console backed by a rustyline editor with command completion.
pub struct LineConsole {
    editor: Editor<CommandHelper, DefaultHistory>,
    use_color: bool,
}

impl LineConsole {
    /// Creates a console that completes the given command tokens.
    pub fn new(commands: Vec<String>, use_color: bool) -> Result<Self, ReadlineError> {
        let mut editor = Editor::<CommandHelper, DefaultHistory>::new()?;
        editor.set_helper(Some(CommandHelper { commands }));
        Ok(Self { editor, use_color })
    }
}

impl Console for LineConsole {
    fn print_sys(&mut self, text: &str) {
        if self.use_color {
            println!("{ANSI_DIM}{SYSTEM_PREFIX}{text}{ANSI_RESET}");
        } else {
            println!("{SYSTEM_PREFIX}{text}");
        }
    }

    fn read_line(&mut self, prompt: &str) -> Result<String, ReadlineError> {
        let line = self.editor.readline(prompt)?;
        if !line.trim().is_empty() {
            let _ = self.editor.add_history_entry(line.as_str());
        }
        Ok(line)
    }
}

/// Completes command tokens, ignoring case, at the start of the line.
pub struct CommandHelper {
    commands: Vec<String>,
}

impl CommandHelper {
    /// Candidates for the word ending at `pos`.
    pub fn candidates(&self, line: &str, pos: usize) -> (usize, Vec<String>) {
        let prefix = &line[..pos];
        if prefix.contains(char::is_whitespace) {
            return (pos, Vec::new());
        }
        let lowered = prefix.to_lowercase();
        let matches = self
            .commands
            .iter()
            .filter(|command| command.to_lowercase().starts_with(&lowered))
            .cloned()
            .collect();
        (0, matches)
    }
}

impl Completer for CommandHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        Ok(self.candidates(line, pos))
    }
}

impl Hinter for CommandHelper {
    type Hint = String;
}

impl Highlighter for CommandHelper {}

impl Validator for CommandHelper {}

impl Helper for CommandHelper {}

/////////////////////////////////////////////// Renderer ///////////////////////////////////////////////

/// Sink for assistant replies.
pub trait Renderer: Send {
    /// Print the reply header.
    fn print_header(&mut self);

    /// Print a chunk of reply text.
    ///
    /// This is called incrementally as tokens are streamed from the backend.
    fn print_text(&mut self, text: &str);

    /// Called when a reply is complete.
    fn finish_response(&mut self);
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer {
    stdout: Stdout,
    use_color: bool,
}

impl PlainTextRenderer {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self {
            stdout: io::stdout(),
            use_color,
        }
    }

    fn flush(&mut self) {
        let _ = self.stdout.flush();
    }
}

impl Default for PlainTextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for PlainTextRenderer {
    fn print_header(&mut self) {
        if self.use_color {
            print!("\r{ANSI_CYAN}{REPLY_HEADER}{ANSI_RESET}");
        } else {
            print!("\r{REPLY_HEADER}");
        }
        self.flush();
    }

    fn print_text(&mut self, text: &str) {
        print!("{text}");
        self.flush();
    }

    fn finish_response(&mut self) {
        println!();
        self.flush();
    }
}
