//! External process execution with cooperative cancellation.
//!
//! Every command a task issues (step commands, container invocations and git
//! bookkeeping) goes through a [`ProcessRuntime`]. The production runtime
//! spawns children in their own process group so cancellation can signal the
//! whole tree, then polls until the exit is confirmed.

use std::collections::BTreeMap;
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batch_core::{ContainerConfig, ProcessConfig, ProcessError};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program name or path.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory of the process.
    pub working_dir: PathBuf,
    /// Extra environment variables; the parent environment is inherited.
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Run `program` in `working_dir`.
    #[must_use]
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    /// Run `command` through `sh -c` in `working_dir`.
    #[must_use]
    pub fn shell(command: &str, working_dir: impl Into<PathBuf>) -> Self {
        Self::new("sh", working_dir).args(["-c", command])
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set environment variables.
    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(key, value)| (key.clone(), value.clone())));
        self
    }

    /// Program and arguments joined for log and error messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured outcome of a process that exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl ProcessOutput {
    /// Whether the process exited with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Exit code, `-1` for signal terminations.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }
}

/// Runs external processes.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Run `spec` to completion, terminating it when `cancel` fires.
    ///
    /// # Errors
    /// Returns [`ProcessError::Launch`] if the program cannot be started,
    /// [`ProcessError::Cancelled`] if `cancel` fired and the process exited, and
    /// [`ProcessError::TerminationFailed`] if it could not be stopped.
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError>;
}

/// [`ProcessRuntime`] backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessRuntime {
    poll_interval: Duration,
    grace_period: Duration,
    deadline: Duration,
}

impl Default for TokioProcessRuntime {
    fn default() -> Self {
        Self::from(&ProcessConfig::default())
    }
}

impl From<&ProcessConfig> for TokioProcessRuntime {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            grace_period: Duration::from_millis(config.grace_period_ms),
            deadline: Duration::from_millis(config.termination_deadline_ms),
        }
    }
}

impl TokioProcessRuntime {
    /// Stop `child` and its process group.
    ///
    /// Sends `SIGTERM`, polls for the exit every `poll_interval`, escalates to
    /// `SIGKILL` after `grace_period` and gives up after `deadline`.
    async fn terminate(&self, child: &mut Child) -> Result<(), ProcessError> {
        let Some(pid) = child.id() else {
            return Ok(());
        };
        let started = Instant::now();
        debug!(pid, "terminating process group");
        request_termination(child, pid, false);

        let mut escalated = false;
        loop {
            if child.try_wait()?.is_some() {
                // Stragglers in the group must not outlive the task.
                signal_group(pid, Signal::Kill);
                trace!(pid, elapsed = ?started.elapsed(), "process exited after termination");
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                warn!(pid, deadline = ?self.deadline, "process did not exit");
                return Err(ProcessError::TerminationFailed {
                    pid,
                    deadline: self.deadline,
                });
            }
            if !escalated && elapsed >= self.grace_period {
                debug!(pid, "escalating to forced kill");
                request_termination(child, pid, true);
                escalated = true;
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ProcessRuntime for TokioProcessRuntime {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ProcessError> {
        debug!(
            command = %spec.command_line(),
            dir = %spec.working_dir.display(),
            "running process"
        );

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ProcessError::Launch {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        let stdout = tokio::spawn(collect_output(
            child.stdout.take(),
            spec.program.clone(),
            "stdout",
        ));
        let stderr = tokio::spawn(collect_output(
            child.stderr.take(),
            spec.program.clone(),
            "stderr",
        ));

        let status = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            self.terminate(&mut child).await?;
            let stdout = timeout(self.deadline, join_output(stdout))
                .await
                .unwrap_or_else(|_| Ok(String::new()))?;
            let stderr = timeout(self.deadline, join_output(stderr))
                .await
                .unwrap_or_else(|_| Ok(String::new()))?;
            return Err(ProcessError::Cancelled { stdout, stderr });
        };
        let status = status?;

        // Background children of the command die with it; they would
        // otherwise hold the output pipes open.
        if let Some(pid) = pid {
            signal_group(pid, Signal::Kill);
        }

        let readers = [stdout.abort_handle(), stderr.abort_handle()];
        let joined = tokio::select! {
            joined = join_outputs(stdout, stderr) => Some(joined),
            () = cancel.cancelled() => None,
        };
        let Some(joined) = joined else {
            debug!(command = %spec.program, "cancelled while draining output");
            for reader in readers {
                reader.abort();
            }
            return Err(ProcessError::Cancelled {
                stdout: String::new(),
                stderr: String::new(),
            });
        };

        let (captured_stdout, captured_stderr) = joined?;
        let output = ProcessOutput {
            exit_code: status.code(),
            stdout: captured_stdout,
            stderr: captured_stderr,
        };
        debug!(command = %spec.program, exit_code = output.code(), "process exited");
        Ok(output)
    }
}

async fn collect_output<R>(
    reader: Option<R>,
    program: String,
    stream: &'static str,
) -> Result<String, IoError>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(reader);
    let mut collected = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(collected);
        }
        let text = String::from_utf8_lossy(&line);
        trace!(program = %program, stream, "{}", text.trim_end());
        collected.push_str(&text);
    }
}

async fn join_outputs(
    stdout: JoinHandle<Result<String, IoError>>,
    stderr: JoinHandle<Result<String, IoError>>,
) -> Result<(String, String), ProcessError> {
    Ok((join_output(stdout).await?, join_output(stderr).await?))
}

async fn join_output(handle: JoinHandle<Result<String, IoError>>) -> Result<String, ProcessError> {
    Ok(handle.await.map_err(IoError::other)??)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

fn request_termination(child: &mut Child, pid: u32, force: bool) {
    let signal = if force { Signal::Kill } else { Signal::Terminate };
    if !signal_group(pid, signal) && child.start_kill().is_err() {
        trace!(pid, "process already gone");
    }
}

#[cfg(unix)]
#[allow(unsafe_code, reason = "process groups can only be signalled through libc")]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(group) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: `kill` only takes integers. A negative pid addresses the process
    // group created by `process_group(0)`, whose id equals the leader's pid.
    let result = unsafe { libc::kill(-group, signal) };
    result == 0
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Build the container invocation for a step.
///
/// The workspace root is bind-mounted at the configured work dir and the
/// command runs in the task's sub-path below it.
#[must_use]
pub fn container_spec(
    config: &ContainerConfig,
    image: &str,
    root: &Path,
    path: &str,
    command: &str,
    env: &BTreeMap<String, String>,
) -> ProcessSpec {
    let mount_point = config.work_dir.trim_end_matches('/');
    let work_dir = if path.is_empty() {
        mount_point.to_owned()
    } else {
        format!("{mount_point}/{path}")
    };

    let mut spec = ProcessSpec::new(&config.runtime, root).args([
        "run".to_owned(),
        "--rm".to_owned(),
        "--init".to_owned(),
        "--workdir".to_owned(),
        work_dir,
        "--mount".to_owned(),
        format!("type=bind,source={},target={mount_point}", root.display()),
    ]);
    for (key, value) in env {
        spec = spec.arg("--env").arg(format!("{key}={value}"));
    }
    spec.args([image, "sh", "-c", command])
}
