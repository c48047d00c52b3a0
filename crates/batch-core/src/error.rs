//! Error types for fetching, workspaces, processes and task execution.

use core::result::Result as CoreResult;
use std::io::Error as IoError;
use std::sync::Arc;
use std::time::Duration;

use batch_template::TemplateError;
use thiserror::Error;
use toml::de::Error as TomlDeError;
use toml::ser::Error as TomlSerError;

use crate::types::{Task, TaskResult};

/// Result type for task execution.
pub type Result<T> = CoreResult<T, TaskErrorKind>;

/// Failure to obtain a repository archive.
///
/// `Clone` so a single in-flight fetch can hand its outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The remote has no archive for this repository, revision and path.
    #[error("archive not found for {repository}@{revision} (path `{path}`)")]
    NotFound {
        /// Repository name.
        repository: String,
        /// Requested revision.
        revision: String,
        /// Requested sub-path.
        path: String,
    },

    /// The remote could not be reached or returned an error.
    #[error("fetching archive for {repository} failed: {message}")]
    Network {
        /// Repository name.
        repository: String,
        /// Underlying failure.
        message: String,
    },

    /// Writing the downloaded archive to the cache failed.
    #[error("caching archive for {repository} failed: {message}")]
    Cache {
        /// Repository name.
        repository: String,
        /// Underlying failure.
        message: String,
    },

    /// The fetch was cancelled.
    #[error("fetching archive for {repository} was cancelled")]
    Cancelled {
        /// Repository name.
        repository: String,
    },
}

/// Failure of an external process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started.
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: IoError,
    },

    /// The process was terminated because its cancellation token fired.
    #[error("process was cancelled")]
    Cancelled {
        /// Output captured before termination.
        stdout: String,
        /// Error output captured before termination.
        stderr: String,
    },

    /// Termination was requested but the process never confirmed its exit.
    #[error("process {pid} did not exit within {deadline:?} after termination was requested")]
    TerminationFailed {
        /// Process id.
        pid: u32,
        /// Overall termination deadline.
        deadline: Duration,
    },

    /// Waiting for the process or reading its output failed.
    #[error("IO error while running process: {0}")]
    Io(#[from] IoError),
}

/// Failure to set up or inspect a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The archive could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Creating the temporary directory failed.
    #[error("creating workspace directory failed: {0}")]
    TempDir(#[source] IoError),

    /// Unpacking the archive failed.
    #[error("extracting archive failed: {0}")]
    Extract(#[source] IoError),

    /// A version control command exited unsuccessfully.
    #[error("`{command}` failed with exit code {exit_code}: {stderr}")]
    Vcs {
        /// Command line that failed.
        command: String,
        /// Exit code of the command.
        exit_code: i32,
        /// Error output of the command.
        stderr: String,
    },

    /// A process could not be run.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

/// A step's command exited with a non-zero status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("command `{command}` exited with code {exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
pub struct StepExecutionError {
    /// The rendered command.
    pub command: String,
    /// Exit code; `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// A task ran longer than the configured bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Timeout reached. Execution took longer than {bound:?}.")]
pub struct TimeoutError {
    /// The configured per-task timeout.
    pub bound: Duration,
}

/// Why a task failed.
#[derive(Debug, Error)]
pub enum TaskErrorKind {
    /// Fetching the repository archive failed.
    #[error(transparent)]
    Fetch(FetchError),

    /// Preparing or inspecting the workspace failed.
    #[error(transparent)]
    Workspace(WorkspaceError),

    /// A template of step `step` (1-based) could not be rendered.
    #[error("step {step}: {source}")]
    Template {
        /// 1-based step number.
        step: usize,
        /// Template failure.
        #[source]
        source: TemplateError,
    },

    /// The command of step `step` (1-based) failed.
    #[error("step {step}: {source}")]
    StepExecution {
        /// 1-based step number.
        step: usize,
        /// Command failure.
        #[source]
        source: StepExecutionError,
    },

    /// A declared output could not be parsed.
    #[error("step {step}: output `{output}` is not valid {format}: {message}")]
    Output {
        /// 1-based step number.
        step: usize,
        /// Output name.
        output: String,
        /// Expected format.
        format: String,
        /// Parser message.
        message: String,
    },

    /// The per-task timeout elapsed.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// A process could not be launched or terminated.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The task was cancelled before it finished.
    #[error("execution was cancelled")]
    Cancelled,
}

impl TaskErrorKind {
    /// Whether the error indicates a broken engine rather than a broken task.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Process(ProcessError::TerminationFailed { .. }))
    }
}

impl From<WorkspaceError> for TaskErrorKind {
    fn from(error: WorkspaceError) -> Self {
        match error {
            WorkspaceError::Fetch(fetch) => Self::Fetch(fetch),
            WorkspaceError::Process(process) => Self::Process(process),
            other => Self::Workspace(other),
        }
    }
}

impl From<FetchError> for TaskErrorKind {
    fn from(error: FetchError) -> Self {
        Self::Fetch(error)
    }
}

/// Failure of one task, identified by repository and path.
#[derive(Debug, Error)]
#[error("execution in {} failed: {kind}", display_target(.repository, .path))]
pub struct TaskError {
    /// Repository name.
    pub repository: String,
    /// Sub-path; empty for the repository root.
    pub path: String,
    /// Cause.
    #[source]
    pub kind: TaskErrorKind,
}

fn display_target(repository: &str, path: &str) -> String {
    if path.is_empty() {
        repository.to_owned()
    } else {
        format!("{repository} ({path})")
    }
}

impl TaskError {
    /// Attach the identity of `task` to `kind`.
    #[must_use]
    pub fn new(task: &Task, kind: TaskErrorKind) -> Self {
        Self {
            repository: task.repository.name.clone(),
            path: task.path.clone(),
            kind,
        }
    }
}

/// A task paired with the error that ended it.
#[derive(Debug)]
pub struct TaskFailure {
    /// The failed task.
    pub task: Arc<Task>,
    /// Why it failed.
    pub error: TaskError,
}

/// Aggregate error returned when waiting for an executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// One or more tasks failed; results of the others are preserved.
    #[error("{}", summarize(.failures))]
    TaskFailures {
        /// Every failed task, in completion order.
        failures: Vec<TaskFailure>,
        /// Results of the tasks that succeeded.
        results: Vec<TaskResult>,
    },

    /// Execution was cancelled by the caller.
    #[error("execution was cancelled")]
    Cancelled {
        /// Results of the tasks that finished before cancellation.
        results: Vec<TaskResult>,
    },

    /// The engine itself failed, e.g. a process could not be terminated.
    #[error("internal error: {error}")]
    Internal {
        /// The task error that exposed the fault.
        error: TaskError,
        /// Results of the tasks that succeeded.
        results: Vec<TaskResult>,
    },

    /// A worker task panicked or was aborted.
    #[error("executor worker failed: {message}")]
    Worker {
        /// Join failure description.
        message: String,
        /// Results of the tasks that succeeded.
        results: Vec<TaskResult>,
    },

    /// `wait` was called without a preceding `start`.
    #[error("executor was not started")]
    NotStarted,
}

impl ExecutorError {
    /// Results of the tasks that did succeed.
    #[must_use]
    pub fn results(&self) -> &[TaskResult] {
        match self {
            Self::TaskFailures { results, .. }
            | Self::Cancelled { results }
            | Self::Internal { results, .. }
            | Self::Worker { results, .. } => results,
            Self::NotStarted => &[],
        }
    }
}

fn summarize(failures: &[TaskFailure]) -> String {
    match failures {
        [] => "no task failed".to_owned(),
        [single] => single.error.to_string(),
        [first, rest @ ..] => {
            let mut message = format!("{} tasks failed:\n{}", failures.len(), first.error);
            for failure in rest {
                message.push('\n');
                message.push_str(&failure.error.to_string());
            }
            message
        }
    }
}

/// Failure to load or save configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The home directory could not be determined.
    #[error("could not determine home directory")]
    NoHomeDir,

    /// Reading or writing the file failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// The file is not valid TOML for the configuration schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] TomlDeError),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] TomlSerError),
}
