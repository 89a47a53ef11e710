//! Progress/message reporting and cooperative cancellation.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives what a running operation has to say.
pub trait Reporter {
    /// `done` of `total` bytes transferred.
    fn on_progress(&mut self, done: u64, total: u64);
    /// One line of status text, or an error description.
    fn on_message(&mut self, text: &str, is_error: bool);
}

/// Prints to the terminal: progress on one rewritten line, messages as lines.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    last_percent: Option<u64>,
}

impl Reporter for ConsoleReporter {
    fn on_progress(&mut self, done: u64, total: u64) {
        let percent = (done * 100).checked_div(total).unwrap_or(100);
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        eprint!("\r{}/{} bytes ({}%)", done, total, percent);
        if done >= total {
            eprintln!();
        }
    }

    fn on_message(&mut self, text: &str, is_error: bool) {
        if is_error {
            eprintln!("{}", text);
        } else {
            println!("{}", text);
        }
    }
}

/// A reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_progress(&mut self, _done: u64, _total: u64) {}
    fn on_message(&mut self, _text: &str, _is_error: bool) {}
}

/// Keeps everything it is told, for front-ends that render it later.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    pub progress: Vec<(u64, u64)>,
    pub messages: Vec<(String, bool)>,
}

impl RecordingReporter {
    /// Status lines, without the errors.
    pub fn lines(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|(_, is_error)| !is_error)
            .map(|(text, _)| text.as_str())
            .collect()
    }

    pub fn errors(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|(_, is_error)| *is_error)
            .map(|(text, _)| text.as_str())
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn on_progress(&mut self, done: u64, total: u64) {
        self.progress.push((done, total));
    }

    fn on_message(&mut self, text: &str, is_error: bool) {
        self.messages.push((text.to_string(), is_error));
    }
}

/// Shared flag asking a running operation to stop at the next chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arms the token for the next operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
