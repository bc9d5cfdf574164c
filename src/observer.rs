//! Operational failure events raised by the supervisor
use std::fmt;

use log::error;

/// Fixed message carried by every failure event
pub const FAILURE_MESSAGE: &str = "Exception while running command";

/// Kind of failure that ended a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command could not be launched
    Spawn,
    /// Reading or delivering output failed
    Read,
    /// The command exited with a failure status
    NonZeroExit,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Spawn => "spawn failure",
            FailureKind::Read => "read failure",
            FailureKind::NonZeroExit => "non-zero exit",
        };
        f.write_str(name)
    }
}

/// One classified failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureEvent {
    /// Always [`FAILURE_MESSAGE`]
    pub message: &'static str,
    /// The command line that failed
    pub command: String,
    /// What went wrong
    pub kind: FailureKind,
    /// Underlying cause
    pub cause: String,
}

impl FailureEvent {
    /// Create an event for `command`
    pub fn new(command: impl Into<String>, kind: FailureKind, cause: impl Into<String>) -> Self {
        Self {
            message: FAILURE_MESSAGE,
            command: command.into(),
            kind,
            cause: cause.into(),
        }
    }
}

/// Receives one call per failed generation
pub trait FailureObserver: Send + Sync + 'static {
    /// Called from the supervisor task; must not block
    fn on_failure(&self, event: &FailureEvent);
}

/// Observer that writes failures to the `log` facade at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl FailureObserver for LogObserver {
    fn on_failure(&self, event: &FailureEvent) {
        error!(
            "{}: command '{}' ended with {}: {}",
            event.message, event.command, event.kind, event.cause
        );
    }
}
