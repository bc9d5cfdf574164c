//! Records produced from command output
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PipeConfig;
use crate::process::DecodedLine;

/// Metadata stamped onto every record of a source
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMetadata {
    /// The command line that produced the output
    pub command: String,
    /// Name of the host running the command
    pub host: String,
    /// Caller-supplied fields
    pub fields: HashMap<String, String>,
}

impl RecordMetadata {
    /// Build metadata for a configured source
    pub fn from_config(config: &PipeConfig) -> Self {
        Self {
            command: config.command.clone(),
            host: local_hostname(),
            fields: config.add_field.clone(),
        }
    }
}

/// Resolve the local hostname, falling back to "localhost"
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// One line of command output, ready for the downstream consumer
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// The decoded line, without its terminator
    pub message: String,
    /// The command line that produced it
    pub command: String,
    /// Host the command ran on
    pub host: String,
    /// When the line was read
    pub timestamp: DateTime<Utc>,
    /// Position of the line within its subprocess generation
    pub sequence: u64,
    /// Caller-supplied fields
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

impl Record {
    /// Build a record from a decoded line
    pub fn new(line: DecodedLine, metadata: &Arc<RecordMetadata>) -> Self {
        Self {
            message: line.text,
            command: metadata.command.clone(),
            host: metadata.host.clone(),
            timestamp: Utc::now(),
            sequence: line.sequence,
            fields: metadata.fields.clone(),
        }
    }

    /// Convert the record to a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.message,
            "command": self.command,
            "host": self.host,
            "@timestamp": self.timestamp.to_rfc3339(),
            "sequence": self.sequence,
            "fields": self.fields,
        })
    }
}
