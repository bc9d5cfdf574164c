use config::{self, File};
use log::{debug, error};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SourceError};
use crate::policy::RestartPolicy;

/// Prefix for environment overrides, e.g. `PIPESOURCE_RESTART=never`
pub const ENV_PREFIX: &str = "PIPESOURCE";

/// Configuration for one pipe source
#[derive(Debug, Deserialize, Clone)]
pub struct PipeConfig {
    /// Shell command line to run
    pub command: String,
    /// What to do when the command exits
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Seconds to wait before spawning again
    #[serde(default = "default_restart_delay", alias = "wait_on_restart")]
    pub restart_delay: f64,
    /// Seconds between the graceful interrupt and the forced kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: f64,
    /// Give up after this many consecutive failed generations
    #[serde(default)]
    pub max_restart_attempts: Option<usize>,
    /// Extra fields copied into every record
    #[serde(default)]
    pub add_field: HashMap<String, String>,
    /// Extra environment variables for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the command
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Shell program used instead of the platform shell
    #[serde(default)]
    pub shell: Option<String>,
    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Default restart delay
fn default_restart_delay() -> f64 {
    1.0
}

/// Default stop timeout
fn default_stop_timeout() -> f64 {
    5.0
}

/// Logging level
#[derive(Debug, Deserialize, Clone, PartialEq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl PipeConfig {
    /// Create a configuration for `command` with default settings
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            restart: RestartPolicy::default(),
            restart_delay: default_restart_delay(),
            stop_timeout: default_stop_timeout(),
            max_restart_attempts: None,
            add_field: HashMap::new(),
            env: HashMap::new(),
            working_dir: None,
            shell: None,
            log_level: LogLevel::default(),
        }
    }

    /// Set the restart policy
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Set the restart delay
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay.as_secs_f64();
        self
    }

    /// Set the grace period used when terminating the command
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout.as_secs_f64();
        self
    }

    /// Limit consecutive failed generations
    pub fn with_max_restart_attempts(mut self, attempts: usize) -> Self {
        self.max_restart_attempts = Some(attempts);
        self
    }

    /// Add a field copied into every record
    pub fn add_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable for the command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run the command in `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run the command through `shell` instead of the platform shell
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Parse a configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(|e| SourceError::config(format!("Failed to build configuration: {}", e)))?;

        deserialize(config)
    }

    /// Restart delay as a duration
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_delay.max(0.0))
    }

    /// Stop timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout.max(0.0))
    }

    /// Check the configuration before anything is spawned
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(SourceError::config("command must not be empty"));
        }

        if !self.restart_delay.is_finite() || self.restart_delay < 0.0 {
            return Err(SourceError::config(format!(
                "restart_delay must be a non-negative number of seconds, got {}",
                self.restart_delay
            )));
        }

        if !self.stop_timeout.is_finite() || self.stop_timeout < 0.0 {
            return Err(SourceError::config(format!(
                "stop_timeout must be a non-negative number of seconds, got {}",
                self.stop_timeout
            )));
        }

        if let Some(shell) = &self.shell {
            if shell.trim().is_empty() {
                return Err(SourceError::config("shell must not be empty when set"));
            }
        }

        if self.max_restart_attempts == Some(0) {
            return Err(SourceError::config(
                "max_restart_attempts must be at least 1 when set",
            ));
        }

        Ok(())
    }
}

/// Load a pipe configuration from a file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipeConfig> {
    let builder = file_source(path.as_ref())?;
    let config = builder
        .build()
        .map_err(|e| SourceError::config(format!("Failed to build configuration: {}", e)))?;

    deserialize(config)
}

/// Load a pipe configuration from a file, then apply `PIPESOURCE_*` overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<PipeConfig> {
    debug!("Loading configuration from environment with prefix: {}", ENV_PREFIX);

    let config = file_source(path.as_ref())?
        .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .map_err(|e| SourceError::config(format!("Failed to build configuration: {}", e)))?;

    deserialize(config)
}

fn file_source(
    path: &Path,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    debug!("Loading configuration from {}", path.display());

    if !path.exists() {
        error!("Configuration file {} does not exist", path.display());
        return Err(SourceError::config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => {
            error!("Configuration file has no extension");
            return Err(SourceError::config(format!(
                "Configuration file has no extension: {}",
                path.display()
            )));
        }
    };

    let format = match extension.as_str() {
        "toml" => config::FileFormat::Toml,
        "json" => config::FileFormat::Json,
        "yaml" | "yml" => config::FileFormat::Yaml,
        format => {
            error!("Unsupported configuration format: {}", format);
            return Err(SourceError::config(format!(
                "Unsupported config format: {}",
                format
            )));
        }
    };

    Ok(config::Config::builder().add_source(File::from(path).format(format)))
}

fn deserialize(config: config::Config) -> Result<PipeConfig> {
    let parsed: PipeConfig = config
        .try_deserialize()
        .map_err(|e| SourceError::config(format!("Failed to deserialize configuration: {}", e)))?;

    parsed.validate()?;
    debug!("Configuration loaded successfully: {:?}", parsed);

    Ok(parsed)
}
