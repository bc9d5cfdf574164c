// src/error.rs
use thiserror::Error;

/// Result type for source operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Custom Error type for the pipesource library
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),
}

impl SourceError {
    /// Shorthand for building a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SourceError::Configuration(msg.into())
    }

    /// Whether this error was raised while validating configuration
    pub fn is_configuration(&self) -> bool {
        matches!(self, SourceError::Configuration(_))
    }
}

impl From<tokio::task::JoinError> for SourceError {
    fn from(err: tokio::task::JoinError) -> Self {
        SourceError::Supervisor(err.to_string())
    }
}
