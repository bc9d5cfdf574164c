//! Subprocess management for the pipe source
//!
//! This module spawns the configured command through the platform shell,
//! owns the resulting process for one generation, and turns its output
//! into decoded lines.

mod command;
mod decoder;
mod error;

pub use command::{ProcessHandle, ShellCommand};
pub use decoder::{DecodedLine, LineDecoder};
pub use error::{ProcessError, ProcessResult};
