//! Restart supervision for the piped command
//!
//! The supervisor runs as a single task. Each generation it spawns the
//! command, starts a [`ReaderLoop`] against its stdout, waits for the loop
//! to end, classifies the result as an [`Outcome`] and asks the
//! [`RestartPolicy`](crate::policy::RestartPolicy) what to do next.
//!
//! ```text
//!  Idle ──start──▶ Running ──outcome, policy says stop──▶ Stopped
//!                  │  ▲
//!                  │  └── restart delay ◀── outcome, policy says restart
//!                  │
//!                  └──stop request──▶ Stopping ──▶ Stopped
//! ```
//!
//! A stop request wins over any restart decision: it interrupts the restart
//! delay, terminates the live process, and joins the reader before the
//! state becomes `Stopped`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace, warn};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::PipeConfig;
use crate::observer::{FailureEvent, FailureKind, FailureObserver};
use crate::policy::Transition;
use crate::process::{ProcessError, ProcessHandle, ShellCommand};
use crate::reader::{ReaderExit, ReaderLoop, stop_requested};
use crate::record::RecordMetadata;
use crate::sink::RecordSink;

/// Lifecycle state of a supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not started yet
    Idle,
    /// Supervising a command, including restart delays
    Running,
    /// A stop request is being carried out
    Stopping,
    /// Terminal; nothing will be spawned again
    Stopped,
}

/// How one generation ended
#[derive(Debug)]
pub enum Outcome {
    /// The command ran and exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// The command could not be launched
    SpawnFailure(ProcessError),
    /// Reading, decoding or delivering output failed
    ReadFailure(ProcessError),
    /// The generation was ended by a stop request
    StoppedByRequest,
}

impl Outcome {
    /// Only an exit with status 0 is clean
    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::Exited { code: Some(0) })
    }

    /// Failure kind and cause, if this outcome is a failure
    pub fn failure(&self) -> Option<(FailureKind, String)> {
        match self {
            Outcome::Exited { code: Some(0) } | Outcome::StoppedByRequest => None,
            Outcome::Exited { code: Some(code) } => {
                Some((FailureKind::NonZeroExit, format!("exit status {}", code)))
            }
            Outcome::Exited { code: None } => Some((
                FailureKind::NonZeroExit,
                "terminated by signal".to_string(),
            )),
            Outcome::SpawnFailure(e) => Some((FailureKind::Spawn, e.to_string())),
            Outcome::ReadFailure(e) => Some((FailureKind::Read, e.to_string())),
        }
    }
}

/// Everything a supervisor task needs, moved into the task on start
pub(crate) struct Supervisor {
    config: Arc<PipeConfig>,
    command: ShellCommand,
    sink: Arc<dyn RecordSink>,
    metadata: Arc<RecordMetadata>,
    observer: Arc<dyn FailureObserver>,
    stop: watch::Receiver<bool>,
    state: Arc<watch::Sender<SupervisorState>>,
    ready: Arc<AtomicBool>,
    first_attempt: Option<oneshot::Sender<()>>,
    generation: u64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<PipeConfig>,
        sink: Arc<dyn RecordSink>,
        metadata: Arc<RecordMetadata>,
        observer: Arc<dyn FailureObserver>,
        stop: watch::Receiver<bool>,
        state: Arc<watch::Sender<SupervisorState>>,
        ready: Arc<AtomicBool>,
        first_attempt: oneshot::Sender<()>,
    ) -> Self {
        Self {
            command: ShellCommand::from_config(&config),
            config,
            sink,
            metadata,
            observer,
            stop,
            state,
            ready,
            first_attempt: Some(first_attempt),
            generation: 0,
        }
    }

    /// Supervise until the policy or a stop request ends it
    pub(crate) async fn run(mut self) {
        self.set_state(SupervisorState::Running);
        let mut failures = 0usize;

        loop {
            if self.stop_pending() {
                debug!("Stop requested before spawning '{}'", self.command.line());
                break;
            }

            self.generation += 1;
            let outcome = self.run_generation().await;
            trace!(
                "Generation {} of '{}' ended with {:?}",
                self.generation,
                self.command.line(),
                outcome
            );

            if let Some((kind, cause)) = outcome.failure() {
                failures += 1;
                self.report(kind, cause);
            } else if outcome.is_clean() {
                failures = 0;
            }

            match self.config.restart.after(&outcome) {
                Transition::Stop => break,
                Transition::Restart => {
                    if let Some(max) = self.config.max_restart_attempts {
                        if failures > max {
                            warn!(
                                "Giving up on '{}' after {} consecutive failures",
                                self.command.line(),
                                failures
                            );
                            break;
                        }
                    }

                    if !self.restart_delay().await {
                        debug!("Restart of '{}' cancelled by stop request", self.command.line());
                        break;
                    }
                }
            }
        }

        self.first_attempt_done();
        self.set_state(SupervisorState::Stopped);
    }

    /// Spawn one generation and see it through to its outcome
    async fn run_generation(&mut self) -> Outcome {
        let mut handle = match self.command.spawn() {
            Ok(handle) => handle,
            Err(e) => {
                self.first_attempt_done();
                return Outcome::SpawnFailure(e);
            }
        };

        let stdout = match handle.take_stdout() {
            Ok(stdout) => stdout,
            Err(e) => {
                self.first_attempt_done();
                self.terminate(&mut handle).await;
                return Outcome::ReadFailure(e);
            }
        };

        let reader = ReaderLoop::new(
            stdout,
            Arc::clone(&self.sink),
            Arc::clone(&self.metadata),
            self.stop.clone(),
        );
        let (reader_task, mut exit_rx) = reader.spawn();

        if !self.ready.swap(true, Ordering::SeqCst) {
            debug!("Source for '{}' is ready", self.command.line());
        }
        self.first_attempt_done();

        let mut stop = self.stop.clone();
        let exit = tokio::select! {
            exit = &mut exit_rx => Some(exit.unwrap_or_else(|_| {
                ReaderExit::Failed(ProcessError::Delivery(
                    "reader ended without reporting".to_string(),
                ))
            })),
            _ = stop_requested(&mut stop) => None,
        };

        let exit = match exit {
            Some(exit) => exit,
            None => return self.shutdown(handle, Some(reader_task), Some(exit_rx)).await,
        };

        let lines = match exit {
            ReaderExit::Stopped => return self.shutdown(handle, Some(reader_task), None).await,
            ReaderExit::Failed(e) => {
                self.terminate(&mut handle).await;
                join_reader(reader_task).await;
                return Outcome::ReadFailure(e);
            }
            ReaderExit::EndOfStream { lines } => lines,
        };

        join_reader(reader_task).await;
        debug!(
            "Command '{}' closed its output after {} lines",
            self.command.line(),
            lines
        );

        // Output is closed but the process may linger; keep the wait stoppable
        let waited = tokio::select! {
            status = handle.wait() => Some(status),
            _ = stop_requested(&mut stop) => None,
        };

        match waited {
            Some(Ok(status)) => Outcome::Exited {
                code: status.code(),
            },
            Some(Err(e)) => Outcome::ReadFailure(e),
            None => self.shutdown(handle, None, None).await,
        }
    }

    /// Carry out a stop request against the live generation
    async fn shutdown(
        &mut self,
        mut handle: ProcessHandle,
        reader_task: Option<JoinHandle<()>>,
        pending_exit: Option<oneshot::Receiver<ReaderExit>>,
    ) -> Outcome {
        self.set_state(SupervisorState::Stopping);
        self.terminate(&mut handle).await;

        if let Some(exit_rx) = pending_exit {
            // Terminating closed the pipe, or the reader saw the stop signal
            let _ = exit_rx.await;
        }
        if let Some(task) = reader_task {
            join_reader(task).await;
        }

        Outcome::StoppedByRequest
    }

    /// Hand a failure to the observer unless a stop is underway
    fn report(&self, kind: FailureKind, cause: String) {
        if self.stop_pending() {
            debug!(
                "Not reporting {} of '{}' during stop: {}",
                kind,
                self.command.line(),
                cause
            );
            return;
        }

        self.observer
            .on_failure(&FailureEvent::new(self.command.line(), kind, cause));
    }

    async fn terminate(&self, handle: &mut ProcessHandle) {
        if let Err(e) = handle.terminate(self.config.stop_timeout()).await {
            warn!("Failed to terminate '{}': {}", self.command.line(), e);
        }
    }

    /// Sleep for the restart delay; false when a stop request cut it short
    async fn restart_delay(&mut self) -> bool {
        let delay = self.config.restart_delay();
        debug!("Restarting '{}' in {:?}", self.command.line(), delay);

        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn stop_pending(&self) -> bool {
        *self.stop.borrow()
    }

    fn first_attempt_done(&mut self) {
        if let Some(tx) = self.first_attempt.take() {
            let _ = tx.send(());
        }
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                "Supervisor for '{}': {:?} -> {:?}",
                self.command.line(),
                previous,
                next
            );
        }
    }
}

async fn join_reader(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("Reader task failed: {}", e);
    }
}
