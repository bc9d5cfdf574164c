use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::process::{Child, ChildStderr, ChildStdout, Command as TokioCommand};
use tokio::time::timeout;

use super::decoder::LineDecoder;
use super::error::{ProcessError, ProcessResult};
use crate::config::PipeConfig;

/// A command line run through the platform shell
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Command line handed to the shell
    line: String,

    /// Current working directory
    current_dir: Option<PathBuf>,

    /// Environment variables
    env_vars: HashMap<String, String>,

    /// Shell program, the platform shell when unset
    shell: Option<String>,
}

#[cfg(unix)]
const PLATFORM_SHELL: (&str, &str) = ("sh", "-c");

#[cfg(not(unix))]
const PLATFORM_SHELL: (&str, &str) = ("cmd", "/C");

impl ShellCommand {
    /// Create a new shell command
    pub fn new<S: Into<String>>(line: S) -> Self {
        Self {
            line: line.into(),
            current_dir: None,
            env_vars: HashMap::new(),
            shell: None,
        }
    }

    /// Build the command a pipe source runs
    pub fn from_config(config: &PipeConfig) -> Self {
        let mut command = Self::new(config.command.clone());
        if let Some(dir) = &config.working_dir {
            command = command.current_dir(dir);
        }
        if let Some(shell) = &config.shell {
            command = command.shell(shell.clone());
        }
        for (key, val) in &config.env {
            command = command.env(key.clone(), val.clone());
        }
        command
    }

    /// The command line as configured
    pub fn line(&self) -> &str {
        &self.line
    }

    /// Set the current working directory
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.insert(key.into(), val.into());
        self
    }

    /// Run through `program` instead of the platform shell
    pub fn shell<S: Into<String>>(mut self, program: S) -> Self {
        self.shell = Some(program.into());
        self
    }

    fn build(&self) -> TokioCommand {
        let (platform, flag) = PLATFORM_SHELL;
        let mut cmd = TokioCommand::new(self.shell.as_deref().unwrap_or(platform));
        cmd.arg(flag).arg(&self.line);
        // Own process group, so a terminate reaches pipelines and children too
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Launch the command with stdout and stderr captured
    ///
    /// Must be called from within a tokio runtime; stderr is drained by a
    /// background task that logs each line.
    pub fn spawn(&self) -> ProcessResult<ProcessHandle> {
        debug!("Spawning command: {}", self.line);

        let mut cmd = self.build();

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        for (key, val) in &self.env_vars {
            cmd.env(key, val);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(self.line.clone(), stderr));
        }

        debug!("Command '{}' started with pid {:?}", self.line, pid);

        Ok(ProcessHandle {
            child,
            pid,
            command: self.line.clone(),
            status: None,
        })
    }
}

/// Drain a child's stderr into the log
async fn log_stderr(command: String, stderr: ChildStderr) {
    let mut decoder = LineDecoder::new(stderr);
    loop {
        match decoder.next_line().await {
            Ok(Some(line)) => debug!("[{}] stderr: {}", command, line.text),
            Ok(None) => break,
            Err(ProcessError::Decode { line, .. }) => {
                debug!("[{}] stderr line {} is not valid UTF-8", command, line)
            }
            Err(e) => {
                debug!("[{}] stopped reading stderr: {}", command, e);
                break;
            }
        }
    }
}

/// Handle to one running subprocess
///
/// Owns the child for exactly one generation. The exit status is cached
/// once the child has been reaped, so `wait` and `terminate` can be called
/// in any order and any number of times.
pub struct ProcessHandle {
    /// Child process
    child: Child,

    /// Process ID, also the process group ID on unix
    pid: Option<u32>,

    /// Command line, for log messages
    command: String,

    /// Exit status once reaped
    status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// Process ID of the shell
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the stdout pipe; only the first call succeeds
    pub fn take_stdout(&mut self) -> ProcessResult<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or(ProcessError::MissingStream("stdout"))
    }

    /// Exit status if the process has already been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Check for exit without blocking
    pub fn try_wait(&mut self) -> ProcessResult<Option<ExitStatus>> {
        if self.status.is_some() {
            return Ok(self.status);
        }

        let status = self.child.try_wait().map_err(ProcessError::Wait)?;
        if let Some(status) = status {
            self.reaped(status);
        }
        Ok(status)
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> ProcessResult<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        let status = self.child.wait().await.map_err(ProcessError::Wait)?;
        self.reaped(status);
        Ok(status)
    }

    /// Stop the process, gracefully first and forcibly after `grace`
    ///
    /// Calling this on a process that has already exited only returns its
    /// status.
    pub async fn terminate(&mut self, grace: Duration) -> ProcessResult<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }

        if let Some(status) = self.try_wait()? {
            // The shell is gone but its group may still hold the pipes open
            self.signal_group_quietly();
            return Ok(status);
        }

        debug!("Terminating '{}' (pid {:?})", self.command, self.pid);
        if let Err(e) = self.interrupt() {
            warn!("Failed to interrupt '{}': {}", self.command, e);
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.reaped(status);
                Ok(status)
            }
            Ok(Err(e)) => Err(ProcessError::Wait(e)),
            Err(_) => {
                warn!(
                    "Command '{}' did not exit within {:?}, killing it",
                    self.command, grace
                );
                self.force_kill();
                self.wait().await
            }
        }
    }

    fn reaped(&mut self, status: ExitStatus) {
        trace!("Command '{}' reaped with {}", self.command, status);
        self.status = Some(status);
    }

    #[cfg(unix)]
    fn send_group(&self, signal: nix::sys::signal::Signal) -> ProcessResult<()> {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = self.pid.ok_or(ProcessError::Signal("no process id".to_string()))?;
        killpg(Pid::from_raw(pid as i32), signal)
            .map_err(|e| ProcessError::Signal(format!("{:?} to group {}: {}", signal, pid, e)))
    }

    #[cfg(unix)]
    fn interrupt(&mut self) -> ProcessResult<()> {
        self.send_group(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> ProcessResult<()> {
        self.child
            .start_kill()
            .map_err(|e| ProcessError::Signal(e.to_string()))
    }

    #[cfg(unix)]
    fn signal_group_quietly(&self) {
        if let Err(e) = self.send_group(nix::sys::signal::Signal::SIGTERM) {
            trace!("No stragglers left for '{}': {}", self.command, e);
        }
    }

    #[cfg(not(unix))]
    fn signal_group_quietly(&self) {}

    fn force_kill(&mut self) {
        #[cfg(unix)]
        {
            if let Err(e) = self.send_group(nix::sys::signal::Signal::SIGKILL) {
                debug!("Failed to kill group of '{}': {}", self.command, e);
            }
        }

        if let Err(e) = self.child.start_kill() {
            debug!("Failed to kill '{}': {}", self.command, e);
        }
    }
}
