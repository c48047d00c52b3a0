//! Core types for executing batch change steps across repositories.
//!
//! This crate provides the task model, error types, status tracking and
//! configuration shared by the workspace and executor crates.

/// Configuration loading and defaults.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Observable task lifecycle states.
pub mod status;
/// Lock helpers.
pub mod sync;
/// Tasks, steps and results.
pub mod types;

pub use batch_template::{BatchChangeAttributes, RepositoryAttributes, StepContext, StepSlot};
pub use config::{
    ContainerConfig, ExecutionConfig, ExecutorConfig, ProcessConfig, WorkspaceConfig,
};
pub use error::{
    ConfigError, ExecutorError, FetchError, ProcessError, Result, StepExecutionError, TaskError,
    TaskErrorKind, TaskFailure, TimeoutError, WorkspaceError,
};
pub use sync::{IgnoreLock, IgnoreRwLock};
pub use status::{TaskState, TaskStatus, TaskStatusCollection};
pub use types::{
    ChangedFiles, OutputFormat, OutputSpec, Repository, Step, StepCondition, Task, TaskId,
    TaskResult, diff_file_names,
};
