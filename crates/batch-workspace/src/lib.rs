//! Workspaces for batch change tasks.
//!
//! A workspace is a temporary checkout of one repository sub-path, built from
//! a downloaded archive and tracked with git so steps can be diffed against
//! the pristine state.

/// Workspace factory trait and local implementation.
pub mod creator;
/// Archive source trait and caching fetcher.
pub mod fetcher;
/// Process runtime with forced termination.
pub mod process;
/// The materialized checkout.
pub mod workspace;

use batch_core::WorkspaceError;

/// Result type for workspace operations.
pub type Result<T> = core::result::Result<T, WorkspaceError>;

pub use creator::{LocalWorkspaceCreator, WorkspaceCreator};
pub use fetcher::{ArchiveFetcher, ArchiveSource};
pub use process::{
    ProcessOutput, ProcessRuntime, ProcessSpec, TokioProcessRuntime, container_spec,
};
pub use workspace::Workspace;
