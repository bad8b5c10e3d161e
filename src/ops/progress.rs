//! Progress reporting for running operations
//!
//! Work items hold a cloneable `Reporter`; every call becomes an event on
//! an unbounded channel drained by the operation's driver task, which turns
//! them into D-Bus signals in emission order.

use tokio::sync::mpsc;

/// Message severity, as carried in the `Message` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Success,
    Warning,
    Error,
    Dim,
    Hint,
}

impl MessageKind {
    /// Wire code for the `Message` signal's first argument
    pub fn code(self) -> i32 {
        match self {
            MessageKind::Info => 0,
            MessageKind::Success => 1,
            MessageKind::Warning => 2,
            MessageKind::Error => 3,
            MessageKind::Dim => 4,
            MessageKind::Hint => 5,
        }
    }
}

/// Events emitted by an executing operation
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Message {
        kind: MessageKind,
        text: String,
        indent: i32,
    },
    ProgressStarted {
        id: String,
        description: String,
        /// Total units of work, 0 for indeterminate
        total: u64,
        indent: i32,
    },
    ProgressUpdate {
        id: String,
        current: u64,
        rate: f64,
    },
    ProgressCompleted {
        id: String,
        success: bool,
        message: String,
    },
}

/// Handle through which work items report progress.
///
/// Every method is non-blocking and safe to call from any context inside
/// the operation's task. Events sent after the operation reached a terminal
/// state are dropped by the driver.
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl Reporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ProgressEvent) {
        // The driver only goes away after the work item, so a closed
        // channel just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }

    pub fn message(&self, kind: MessageKind, text: impl Into<String>, indent: i32) {
        self.send(ProgressEvent::Message {
            kind,
            text: text.into(),
            indent,
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(MessageKind::Info, text, 0);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.message(MessageKind::Success, text, 0);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.message(MessageKind::Warning, text, 0);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(MessageKind::Error, text, 0);
    }

    pub fn dim(&self, text: impl Into<String>) {
        self.message(MessageKind::Dim, text, 0);
    }

    pub fn hint(&self, text: impl Into<String>) {
        self.message(MessageKind::Hint, text, 0);
    }

    /// Begin a named sub-progress; `total = 0` means indeterminate
    pub fn progress_start(&self, id: &str, description: &str, total: u64, indent: i32) {
        self.send(ProgressEvent::ProgressStarted {
            id: id.to_string(),
            description: description.to_string(),
            total,
            indent,
        });
    }

    pub fn progress_update(&self, id: &str, current: u64, rate: f64) {
        self.send(ProgressEvent::ProgressUpdate {
            id: id.to_string(),
            current,
            rate,
        });
    }

    pub fn progress_end(&self, id: &str, success: bool, message: &str) {
        self.send(ProgressEvent::ProgressCompleted {
            id: id.to_string(),
            success,
            message: message.to_string(),
        });
    }
}
