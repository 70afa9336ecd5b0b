use std::fmt;

use owo_colors::OwoColorize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{CommandResult, TaskOutcome, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// One line of human readable status plus a machine readable severity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub severity: Severity,
    pub text: String,
}

impl StatusLine {
    pub fn new(severity: Severity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }

    /// The text colored by severity for terminals
    pub fn colored(&self) -> String {
        match self.severity {
            Severity::Info => self.text.cyan().to_string(),
            Severity::Success => self.text.green().to_string(),
            Severity::Error => self.text.red().to_string(),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Everything that can change the status line
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Task(TaskState),
    Command { task: String, result: CommandResult },
    PollFailed(String),
    PollRecovered,
    Info(String),
}

/// Maps an event to its status line. This has no side effects.
pub fn report(event: &StatusEvent) -> StatusLine {
    match event {
        StatusEvent::Task(state) => {
            let (severity, mut text) = match state.outcome {
                TaskOutcome::Pending => (Severity::Info, format!("{} in progress...", state.name)),
                TaskOutcome::Succeeded => (Severity::Success, format!("{} succeeded", state.name)),
                TaskOutcome::Failed => (Severity::Error, format!("{} failed", state.name)),
                TaskOutcome::TimedOut => {
                    (Severity::Error, format!("{} failed: timed out", state.name))
                }
            };
            if let Some(message) = &state.message {
                text.push_str(": ");
                text.push_str(message);
            }
            StatusLine::new(severity, text)
        }
        StatusEvent::Command { task, result } => match result.diagnostic() {
            None => StatusLine::new(Severity::Success, format!("{task} succeeded")),
            Some(diagnostic) => {
                StatusLine::new(Severity::Error, format!("{task} failed: {diagnostic}"))
            }
        },
        StatusEvent::PollFailed(reason) => StatusLine::new(
            Severity::Error,
            format!("inventory refresh failed: {reason}"),
        ),
        StatusEvent::PollRecovered => {
            StatusLine::new(Severity::Info, "inventory refresh recovered")
        }
        StatusEvent::Info(text) => StatusLine::new(Severity::Info, text.clone()),
    }
}

/// Publishes status lines to the consumer it was constructed with
#[derive(Debug, Clone)]
pub struct StatusReporter {
    sink: mpsc::UnboundedSender<StatusLine>,
}

impl StatusReporter {
    pub fn new(sink: mpsc::UnboundedSender<StatusLine>) -> Self {
        Self { sink }
    }

    /// Reports `event`, logs the line, and forwards it. A consumer that went
    /// away is not an error.
    pub fn publish(&self, event: StatusEvent) -> StatusLine {
        let line = report(&event);
        match line.severity {
            Severity::Error => error!("{}", line.text),
            Severity::Info | Severity::Success => info!("{}", line.text),
        }
        let _ = self.sink.send(line.clone());
        line
    }
}
