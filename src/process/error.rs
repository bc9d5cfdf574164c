use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Result type for process operations
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to read from process: {0}")]
    Read(#[source] io::Error),

    #[error("Invalid UTF-8 in output line {line}: {source}")]
    Decode {
        line: u64,
        #[source]
        source: FromUtf8Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("Failed to signal process: {0}")]
    Signal(String),

    #[error("Process {0} stream was not captured")]
    MissingStream(&'static str),

    #[error("Downstream rejected record: {0}")]
    Delivery(String),
}
