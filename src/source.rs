//! Host-facing lifecycle of a pipe source
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::PipeConfig;
use crate::error::{Result, SourceError};
use crate::observer::{FailureObserver, LogObserver};
use crate::record::{Record, RecordMetadata};
use crate::sink::RecordSink;
use crate::supervisor::{Supervisor, SupervisorState};

/// A data source backed by a supervised shell command
///
/// Every line the command writes to stdout becomes one [`Record`] handed to
/// the sink. The command is restarted according to the configured policy
/// until [`PipeSource::stop`] is called or the policy gives up.
pub struct PipeSource {
    config: Arc<PipeConfig>,
    sink: Arc<dyn RecordSink>,
    metadata: Arc<RecordMetadata>,
    observer: Arc<dyn FailureObserver>,
    stop: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<SupervisorState>>,
    ready: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PipeSource {
    /// Create a source; fails if the configuration is invalid
    pub fn new<S: RecordSink>(config: PipeConfig, sink: S) -> Result<Self> {
        config.validate()?;

        let metadata = Arc::new(RecordMetadata::from_config(&config));
        let (stop, _) = watch::channel(false);
        let (state, _) = watch::channel(SupervisorState::Idle);

        Ok(Self {
            config: Arc::new(config),
            sink: Arc::new(sink),
            metadata,
            observer: Arc::new(LogObserver),
            stop: Arc::new(stop),
            state: Arc::new(state),
            ready: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Create a source that delivers into a bounded channel
    pub fn channel(config: PipeConfig, capacity: usize) -> Result<(Self, mpsc::Receiver<Record>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Ok((Self::new(config, tx)?, rx))
    }

    /// Replace the default log observer
    pub fn with_observer<O: FailureObserver>(mut self, observer: O) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// The configuration this source was built from
    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Begin supervision
    ///
    /// Returns once the first spawn has been attempted; the command keeps
    /// running in the background. Starting twice, or after a stop, does
    /// nothing.
    pub async fn start(&self) -> Result<()> {
        let first_attempt = {
            let mut slot = self.task.lock().await;

            if slot.is_some() || self.state() != SupervisorState::Idle {
                warn!("Source for '{}' already started", self.config.command);
                return Ok(());
            }

            info!(
                "Starting source for '{}' (restart: {})",
                self.config.command, self.config.restart
            );

            let (first_tx, first_rx) = oneshot::channel();
            let supervisor = Supervisor::new(
                Arc::clone(&self.config),
                Arc::clone(&self.sink),
                Arc::clone(&self.metadata),
                Arc::clone(&self.observer),
                self.stop.subscribe(),
                Arc::clone(&self.state),
                Arc::clone(&self.ready),
                first_tx,
            );

            *slot = Some(tokio::spawn(supervisor.run()));
            first_rx
        };

        // The supervisor always reports before it exits
        let _ = first_attempt.await;
        Ok(())
    }

    /// Stop supervision and wait until the command is gone
    ///
    /// Repeated calls are no-ops once the source is stopped.
    pub async fn stop(&self) -> Result<()> {
        self.stop.send_replace(true);

        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                debug!("Waiting for supervisor of '{}' to finish", self.config.command);
                if let Err(e) = task.await {
                    self.state.send_replace(SupervisorState::Stopped);
                    return Err(SourceError::from(e));
                }
            }
            None => {
                self.state.send_if_modified(|state| {
                    if *state == SupervisorState::Idle {
                        *state = SupervisorState::Stopped;
                        true
                    } else {
                        false
                    }
                });
            }
        }

        self.wait_stopped().await;
        info!("Source for '{}' stopped", self.config.command);
        Ok(())
    }

    /// True once the first process has been spawned and is being read
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Current supervisor state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Wait until the supervisor has reached `Stopped`
    pub async fn wait_stopped(&self) {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == SupervisorState::Stopped)
            .await;
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        // Let a still-running supervisor wind down on its own
        self.stop.send_replace(true);
    }
}
