use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use pipesource::config::{LogLevel, PipeConfig, load_config_with_env};
use pipesource::policy::RestartPolicy;
use pipesource::prelude::*;
use pipesource::util::logging;

/// Run a command and emit each line of its output as a JSON record
#[derive(Parser, Debug)]
#[command(name = "pipesource", version = pipesource::VERSION)]
struct Args {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, conflicts_with = "command")]
    config: Option<PathBuf>,

    /// Shell command to run
    #[arg(short = 'e', long, required_unless_present = "config")]
    command: Option<String>,

    /// Restart policy
    #[arg(short, long, value_enum)]
    restart: Option<RestartPolicy>,

    /// Seconds to wait before restarting
    #[arg(long)]
    restart_delay: Option<f64>,

    /// Logging level
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn into_config(self) -> Result<PipeConfig> {
        let mut config = match (&self.config, &self.command) {
            (Some(path), _) => load_config_with_env(path)
                .with_context(|| format!("loading {}", path.display()))?,
            (None, Some(command)) => PipeConfig::new(command.clone()),
            (None, None) => anyhow::bail!("either --config or --command is required"),
        };

        if let Some(restart) = self.restart {
            config.restart = restart;
        }
        if let Some(delay) = self.restart_delay {
            config.restart_delay = delay;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().into_config()?;
    logging::init(&config.log_level);

    let (tx, mut rx) = mpsc::channel::<Record>(128);
    let source = PipeSource::new(config, tx).context("creating source")?;
    source.start().await?;

    let writer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(record) = rx.recv().await {
            let mut out = stdout.lock();
            if let Err(e) = writeln!(out, "{}", record.to_json()) {
                error!("Failed to write record: {}", e);
                break;
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
        _ = source.wait_stopped() => info!("Command will not be restarted"),
    }

    source.stop().await?;
    drop(source);
    writer.await.context("joining record writer")?;

    Ok(())
}
