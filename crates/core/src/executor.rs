// crates/core/src/executor.rs
//! Executor boundary: spawn an external process for a job, stream its output
//! lines, report its exit code, and accept a best-effort termination request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::job::{Job, JobId, JobType};

/// Buffered output lines per process before the reader waits for the driver.
const EVENT_QUEUE: usize = 256;

/// What the executor needs to know about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub source: String,
    pub tmp_id: String,
    pub tmp_dir: PathBuf,
}

impl From<&Job> for ExecutionRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            source: job.source.clone(),
            tmp_id: job.tmp_id.clone(),
            tmp_dir: job.tmp_dir.clone(),
        }
    }
}

/// Message from a running process to its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    Stdout(String),
    Stderr(String),
    /// Process ended. `None` when it was killed by a signal or its status
    /// could not be read.
    Exited(Option<i32>),
}

/// Termination handle for one running process.
pub struct ExecutorHandle {
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl ExecutorHandle {
    pub fn new(pid: Option<u32>, terminate_tx: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            terminate_tx: Some(terminate_tx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. Returns true if the request was delivered.
    /// Dropping the handle without calling this leaves the process alone.
    pub fn terminate(mut self) -> bool {
        match self.terminate_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// A spawned process: its event stream and its termination handle.
pub struct RunningProcess {
    pub events: mpsc::Receiver<ExecutorEvent>,
    pub handle: ExecutorHandle,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Start work for one job. The returned event stream must end with
    /// exactly one [`ExecutorEvent::Exited`].
    async fn spawn(&self, request: &ExecutionRequest) -> Result<RunningProcess, ExecutorError>;
}

/// Runs a command-line tool per job via `tokio::process`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    type_args: HashMap<JobType, Vec<String>>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            type_args: HashMap::new(),
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            type_args: config.type_args.clone(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type_args<I, S>(mut self, job_type: JobType, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.type_args
            .insert(job_type, args.into_iter().map(Into::into).collect());
        self
    }

    /// Type-specific args first, then the common args, placeholders filled in.
    pub fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let tmp_dir = request.tmp_dir.to_string_lossy();
        self.type_args
            .get(&request.job_type)
            .into_iter()
            .flatten()
            .chain(self.args.iter())
            .map(|arg| {
                arg.replace("{source}", &request.source)
                    .replace("{tmp_dir}", &tmp_dir)
                    .replace("{tmp_id}", &request.tmp_id)
            })
            .collect()
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn spawn(&self, request: &ExecutionRequest) -> Result<RunningProcess, ExecutorError> {
        tokio::fs::create_dir_all(&request.tmp_dir)
            .await
            .map_err(|source| ExecutorError::SpawnFailed {
                program: self.program.clone(),
                source,
            })?;

        let args = self.build_args(request);
        tracing::info!(
            job_id = %request.job_id,
            program = %self.program,
            args = ?args,
            "Spawning executor"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(&request.tmp_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| {
            tracing::error!(job_id = %request.job_id, error = %source, "Failed to spawn executor");
            ExecutorError::SpawnFailed {
                program: self.program.clone(),
                source,
            }
        })?;

        let stdout = child.stdout.take().ok_or(ExecutorError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ExecutorError::MissingPipe("stderr"))?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let pid = child.id();

        tokio::spawn(monitor(
            request.job_id.clone(),
            child,
            stdout,
            stderr,
            tx,
            terminate_rx,
        ));

        Ok(RunningProcess {
            events: rx,
            handle: ExecutorHandle::new(pid, terminate_tx),
        })
    }
}

/// Relay output lines until both pipes close, then report the exit code.
/// A termination request at any point sends SIGTERM once.
async fn monitor<O, E>(
    job_id: JobId,
    mut child: Child,
    stdout: O,
    stderr: E,
    tx: mpsc::Sender<ExecutorEvent>,
    mut terminate_rx: oneshot::Receiver<()>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;
    let mut terminate_pending = true;

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => {
                    let _ = tx.send(ExecutorEvent::Stdout(line)).await;
                }
                _ => out_open = false,
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    let _ = tx.send(ExecutorEvent::Stderr(line)).await;
                }
                _ => err_open = false,
            },
            requested = &mut terminate_rx, if terminate_pending => {
                terminate_pending = false;
                if requested.is_ok() {
                    request_termination(&job_id, &mut child);
                }
            }
        }
    }

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            requested = &mut terminate_rx, if terminate_pending => {
                terminate_pending = false;
                if requested.is_ok() {
                    request_termination(&job_id, &mut child);
                }
            }
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to wait for executor");
            None
        }
    };
    tracing::debug!(job_id = %job_id, exit_code = ?code, "Executor exited");
    let _ = tx.send(ExecutorEvent::Exited(code)).await;
}

#[cfg(unix)]
fn request_termination(job_id: &JobId, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    match i32::try_from(pid) {
        Ok(raw) => {
            if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                tracing::warn!(job_id = %job_id, pid, %errno, "Failed to send SIGTERM");
            } else {
                tracing::info!(job_id = %job_id, pid, "Sent SIGTERM to executor");
            }
        }
        Err(_) => tracing::warn!(job_id = %job_id, pid, "PID out of range"),
    }
}

#[cfg(not(unix))]
fn request_termination(job_id: &JobId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(job_id = %job_id, error = %e, "Failed to stop executor");
    }
}
