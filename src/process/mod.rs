//! The side channel that tells the workload its credentials changed.
//!
//! Two independent paths exist. With a command configured, the first X.509 update spawns it
//! and later updates send it the renewal signal; once it exits the next update spawns it
//! again. With a PID file configured, every update reads the PID from the file and signals
//! that process. Failures on either path are logged and counted, never propagated.

pub mod args;

use crate::process::args::{split_args, ArgsError};
use log::{debug, error, info};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::process::Command;

/// A signal sent to the workload after its credentials were renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewSignal(Signal);

impl RenewSignal {
    /// Returns the underlying signal.
    pub fn signal(self) -> Signal {
        self.0
    }
}

impl From<Signal> for RenewSignal {
    fn from(signal: Signal) -> Self {
        RenewSignal(signal)
    }
}

impl FromStr for RenewSignal {
    type Err = ProcessError;

    /// Accepts a name with or without the `SIG` prefix (`SIGHUP`, `hup`) or a signal number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let signal = match trimmed.parse::<i32>() {
            Ok(number) => Signal::try_from(number).ok(),
            Err(_) => {
                let upper = trimmed.to_ascii_uppercase();
                let name = if upper.starts_with("SIG") {
                    upper
                } else {
                    format!("SIG{upper}")
                };
                Signal::from_str(&name).ok()
            }
        };

        signal
            .map(RenewSignal)
            .ok_or_else(|| ProcessError::UnknownSignal(s.to_owned()))
    }
}

impl fmt::Display for RenewSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Errors of the process side channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The renewal signal is neither a known name nor a known number.
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    /// The argument string could not be split.
    #[error("invalid cmd_args: {0}")]
    Args(#[from] ArgsError),

    /// Spawning the command failed.
    #[error("failed to spawn {cmd}: {source}")]
    Spawn {
        /// The command that was spawned.
        cmd: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A process must be signalled but no renewal signal is configured.
    #[error("no renew signal configured")]
    NoRenewSignal,

    /// Sending the signal failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// The target process.
        pid: i32,
        /// The errno returned by `kill(2)`.
        #[source]
        source: Errno,
    },

    /// The PID file could not be read.
    #[error("failed to read pid file {}: {source}", .path.display())]
    PidFile {
        /// The PID file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The PID file does not contain a positive process id.
    #[error("invalid pid in {}: {content:?}", .path.display())]
    InvalidPid {
        /// The PID file.
        path: PathBuf,
        /// The trimmed file content.
        content: String,
    },

    /// The reaper observed an exit for a process that is not the running child.
    #[error("reaper found no running child with pid {0}")]
    NoRunningChild(u32),
}

/// Configuration of the process side channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Command to spawn on the first X.509 update.
    pub cmd: Option<String>,
    /// Argument string of `cmd`.
    pub cmd_args: String,
    /// File holding the PID of an externally managed process to signal.
    pub pid_file_name: Option<PathBuf>,
    /// Signal sent after each renewal.
    pub renew_signal: Option<RenewSignal>,
    /// Whether the child inherits the sidecar's stdin, stdout and stderr.
    pub inherit_stdio: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    NotStarted,
    Running { pid: u32 },
    // `status` is `None` when waiting on the child failed.
    Exited {
        pid: u32,
        status: Option<ExitStatus>,
    },
}

impl ChildState {
    fn mark_exited(
        &mut self,
        exited_pid: u32,
        status: Option<ExitStatus>,
    ) -> Result<(), ProcessError> {
        match *self {
            ChildState::Running { pid } if pid == exited_pid => {
                *self = ChildState::Exited { pid, status };
                Ok(())
            }
            _ => Err(ProcessError::NoRunningChild(exited_pid)),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    spawned: AtomicU64,
    signalled: AtomicU64,
    failures: AtomicU64,
}

/// Counts of side-channel actions since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Children spawned.
    pub spawned: u64,
    /// Signals delivered (to the child or the PID-file process).
    pub signalled: u64,
    /// Failed spawns, signals and PID-file reads.
    pub failures: u64,
}

/// Spawns and signals the workload process.
#[derive(Debug)]
pub struct ProcessManager {
    config: ProcessConfig,
    state: Arc<Mutex<ChildState>>,
    counters: Arc<Counters>,
}

impl ProcessManager {
    /// Creates a manager; nothing is spawned until the first update.
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ChildState::NotStarted)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Creates a manager with neither a command nor a PID file.
    pub fn disabled() -> Self {
        Self::new(ProcessConfig::default())
    }

    /// Reacts to a successful X.509 write: spawns or signals the child and signals the
    /// PID-file process, as configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn on_credentials_updated(&self) {
        if self.config.cmd.is_some() {
            if let Err(e) = self.signal_or_spawn() {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to notify child process: error={}", e);
            }
        }

        if let Some(path) = &self.config.pid_file_name {
            if let Err(e) = self.signal_pid_file(path) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to signal pid file process: error={}", e);
            }
        }
    }

    /// Returns the PID of the running child, if any.
    pub fn child_pid(&self) -> Option<u32> {
        match *self.lock_state() {
            ChildState::Running { pid } => Some(pid),
            ChildState::NotStarted | ChildState::Exited { .. } => None,
        }
    }

    /// Returns the exit status of the last child, if it has exited, none is running and its
    /// status could be collected.
    pub fn last_exit_status(&self) -> Option<ExitStatus> {
        match *self.lock_state() {
            ChildState::Exited { status, .. } => status,
            ChildState::NotStarted | ChildState::Running { .. } => None,
        }
    }

    /// Returns the action counters.
    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            signalled: self.counters.signalled.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_or_spawn(&self) -> Result<(), ProcessError> {
        let mut state = self.lock_state();
        match *state {
            ChildState::Running { pid } => {
                let signal = self.config.renew_signal.ok_or(ProcessError::NoRenewSignal)?;
                send_signal(pid_from_u32(pid), signal)?;
                self.counters.signalled.fetch_add(1, Ordering::Relaxed);
                debug!("Signalled child process: pid={}, signal={}", pid, signal);
                Ok(())
            }
            ChildState::NotStarted | ChildState::Exited { .. } => {
                let pid = self.spawn_child()?;
                *state = ChildState::Running { pid };
                Ok(())
            }
        }
    }

    // Called with the state lock held.
    fn spawn_child(&self) -> Result<u32, ProcessError> {
        let cmd = self.config.cmd.as_deref().unwrap_or_default();
        let args = split_args(&self.config.cmd_args)?;

        let stdio = || {
            if self.config.inherit_stdio {
                Stdio::inherit()
            } else {
                Stdio::null()
            }
        };

        let mut child = Command::new(cmd)
            .args(&args)
            .stdin(stdio())
            .stdout(stdio())
            .stderr(stdio())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                cmd: cmd.to_owned(),
                source,
            })?;

        let pid = child.id().ok_or_else(|| ProcessError::Spawn {
            cmd: cmd.to_owned(),
            source: std::io::Error::other("child exited before its pid was read"),
        })?;
        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        info!("Spawned child process: cmd={}, pid={}", cmd, pid);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let wait = child.wait().await;
            if let Err(e) = reap_child(&state, pid, wait) {
                error!("Child process state corrupted; aborting: error={}", e);
                std::process::abort();
            }
        });

        Ok(pid)
    }

    fn signal_pid_file(&self, path: &Path) -> Result<(), ProcessError> {
        let signal = self.config.renew_signal.ok_or(ProcessError::NoRenewSignal)?;
        let pid = read_pid_file(path)?;
        send_signal(pid, signal)?;
        self.counters.signalled.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Signalled pid file process: path={}, pid={}, signal={}",
            path.display(),
            pid,
            signal
        );
        Ok(())
    }
}

/// Moves the child `pid` out of `Running`, whether or not `wait` collected its status.
///
/// An error means the state no longer tracks `pid` as the running child, which is not
/// recoverable.
fn reap_child(
    state: &Mutex<ChildState>,
    pid: u32,
    wait: std::io::Result<ExitStatus>,
) -> Result<(), ProcessError> {
    let status = match wait {
        Ok(status) => {
            info!("Child process exited: pid={}, status={}", pid, status);
            Some(status)
        }
        Err(e) => {
            error!("Failed to wait for child process: pid={}, error={}", pid, e);
            None
        }
    };

    state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .mark_exited(pid, status)
}

fn read_pid_file(path: &Path) -> Result<Pid, ProcessError> {
    let content = std::fs::read_to_string(path).map_err(|source| ProcessError::PidFile {
        path: path.to_owned(),
        source,
    })?;
    let content = content.trim();

    match content.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
        _ => Err(ProcessError::InvalidPid {
            path: path.to_owned(),
            content: content.to_owned(),
        }),
    }
}

fn pid_from_u32(pid: u32) -> Pid {
    Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX))
}

fn send_signal(pid: Pid, signal: RenewSignal) -> Result<(), ProcessError> {
    kill(pid, signal.signal()).map_err(|source| ProcessError::Signal {
        pid: pid.as_raw(),
        source,
    })
}
