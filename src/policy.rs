//! Restart policies for the supervised command.
//!
//! [`RestartPolicy`] decides what happens after one subprocess generation ends:
//!
//! - [`RestartPolicy::Never`] any exit ends supervision permanently.
//! - [`RestartPolicy::Always`] every exit, clean or not, is followed by a new spawn.
//! - [`RestartPolicy::OnError`] only error outcomes are retried; a clean exit is terminal.
//!
//! ```text
//! outcome            never   always   error
//! exit 0             stop    restart  stop
//! exit != 0          stop    restart  restart
//! spawn failure      stop    restart  restart
//! read failure       stop    restart  restart
//! stopped by request stop    stop     stop
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::supervisor::Outcome;

/// Policy controlling whether the command is spawned again after it exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Run the command once.
    Never,
    /// Restart after every exit.
    Always,
    /// Restart only after a failure.
    #[serde(rename = "error", alias = "on_error")]
    #[value(name = "error", alias = "on_error")]
    OnError,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Always
    }
}

/// What the supervisor does next once a generation has been classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Wait the restart delay, then spawn a new generation
    Restart,
    /// Stop supervising permanently
    Stop,
}

impl RestartPolicy {
    /// Decide the transition that follows `outcome`
    pub fn after(&self, outcome: &Outcome) -> Transition {
        if matches!(outcome, Outcome::StoppedByRequest) {
            return Transition::Stop;
        }

        match self {
            RestartPolicy::Never => Transition::Stop,
            RestartPolicy::Always => Transition::Restart,
            RestartPolicy::OnError if outcome.is_clean() => Transition::Stop,
            RestartPolicy::OnError => Transition::Restart,
        }
    }

    /// Name as written in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnError => "error",
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = crate::error::SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(RestartPolicy::Never),
            "always" => Ok(RestartPolicy::Always),
            "error" | "on_error" => Ok(RestartPolicy::OnError),
            other => Err(crate::error::SourceError::config(format!(
                "unknown restart policy '{}', expected never, always or error",
                other
            ))),
        }
    }
}
