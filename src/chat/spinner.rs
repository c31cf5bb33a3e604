//! Working indicator shown while a turn is in flight.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];
const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const JOIN_WAIT: Duration = Duration::from_millis(250);

/// Something that signals "working" while a reply is awaited.
pub trait Indicator: Send {
    /// Start signalling.  Starting a running indicator does nothing.
    fn start(&mut self);

    /// Stop signalling and erase any transient output.  Idempotent.
    fn stop(&mut self);

    /// True between `start` and `stop`.
    fn is_running(&self) -> bool;
}

/// Animated status line driven by a background thread.
///
/// The thread only writes the status line; it never touches conversation
/// state.  The line is erased on `stop` before control returns, so chat output
/// written afterwards starts on a clean line.
pub struct Spinner {
    message: String,
    running: Arc<AtomicBool>,
    worker: Option<(JoinHandle<()>, mpsc::Receiver<()>)>,
}

impl Spinner {
    /// Creates a stopped spinner showing `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn erase(&self) {
        let width = self.message.chars().count() + 10;
        let mut stdout = io::stdout();
        let _ = write!(stdout, "\r{}\r", " ".repeat(width));
        let _ = stdout.flush();
    }
}

impl Indicator for Spinner {
    fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        // Fresh flag per run so a thread that outlived the join wait cannot be revived.
        self.running = Arc::new(AtomicBool::new(true));
        let running = Arc::clone(&self.running);
        let message = self.message.clone();
        let (exited_tx, exited_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut frame = 0;
            while running.load(Ordering::SeqCst) {
                let mut stdout = io::stdout();
                let _ = write!(stdout, "\r{message}... {}", FRAMES[frame]);
                let _ = stdout.flush();
                frame = (frame + 1) % FRAMES.len();
                thread::sleep(FRAME_INTERVAL);
            }
            let _ = exited_tx.send(());
        });
        self.worker = Some((handle, exited_rx));
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some((handle, exited)) = self.worker.take() else {
            return;
        };
        // A thread that misses the deadline is left to finish on its own.
        if exited.recv_timeout(JOIN_WAIT).is_ok() {
            let _ = handle.join();
        }
        self.erase();
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.stop();
    }
}
