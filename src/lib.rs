//! A process-backed streaming data source
//!
//! Runs a shell command, turns each line of its stdout into a record for a
//! downstream sink, and restarts the command according to a policy.

pub mod config;
pub mod error;
pub mod observer;
pub mod policy;
pub mod process;
pub mod reader;
pub mod record;
pub mod sink;
pub mod source;
pub mod supervisor;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::config::{PipeConfig, load_config};
    pub use crate::error::{Result, SourceError};
    pub use crate::observer::{FailureEvent, FailureKind, FailureObserver, LogObserver};
    pub use crate::policy::RestartPolicy;
    pub use crate::record::Record;
    pub use crate::sink::RecordSink;
    pub use crate::source::PipeSource;
    pub use crate::supervisor::SupervisorState;
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
