//! Factory producing one fresh [`Workspace`] per task.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use batch_core::{ContainerConfig, ExecutorConfig, Task, WorkspaceError};
use tempfile::{Builder, TempDir};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Result;
use crate::fetcher::{ArchiveFetcher, ArchiveSource};
use crate::process::{ProcessRuntime, TokioProcessRuntime};
use crate::workspace::Workspace;

/// Creates workspaces for tasks.
#[async_trait]
pub trait WorkspaceCreator: Send + Sync {
    /// Fetch the task's archive and materialize it in a new directory.
    ///
    /// # Errors
    /// Returns a [`WorkspaceError`] if fetching, unpacking or git setup fails.
    async fn create(&self, cancel: &CancellationToken, task: &Task) -> Result<Workspace>;
}

/// Creates workspaces in temporary directories on the local disk.
pub struct LocalWorkspaceCreator {
    fetcher: ArchiveFetcher,
    runtime: Arc<dyn ProcessRuntime>,
    temp_dir: Option<PathBuf>,
    container: ContainerConfig,
}

impl LocalWorkspaceCreator {
    /// Create a creator using `fetcher` and `runtime`.
    #[must_use]
    pub fn new(fetcher: ArchiveFetcher, runtime: Arc<dyn ProcessRuntime>) -> Self {
        Self {
            fetcher,
            runtime,
            temp_dir: None,
            container: ContainerConfig::default(),
        }
    }

    /// Create a creator wired from configuration, using the tokio process
    /// runtime.
    #[must_use]
    pub fn from_config(source: Arc<dyn ArchiveSource>, config: &ExecutorConfig) -> Self {
        let fetcher = ArchiveFetcher::from_config(source, &config.workspace);
        let runtime = Arc::new(TokioProcessRuntime::from(&config.process));
        Self {
            fetcher,
            runtime,
            temp_dir: config.workspace.temp_dir.clone(),
            container: config.container.clone(),
        }
    }

    /// Create workspace directories below `temp_dir` instead of the system
    /// temp dir.
    #[must_use]
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(temp_dir.into());
        self
    }

    /// Container runtime used for steps with an image.
    #[must_use]
    pub fn with_container(mut self, container: ContainerConfig) -> Self {
        self.container = container;
        self
    }

    fn temp_dir(&self) -> Result<TempDir> {
        let mut builder = Builder::new();
        builder.prefix("batch-workspace-");
        let dir = match &self.temp_dir {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(WorkspaceError::TempDir)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        dir.map_err(WorkspaceError::TempDir)
    }
}

#[async_trait]
impl WorkspaceCreator for LocalWorkspaceCreator {
    async fn create(&self, cancel: &CancellationToken, task: &Task) -> Result<Workspace> {
        let archive = self
            .fetcher
            .fetch(cancel, &task.repository, &task.path)
            .await?;
        let additional_files = self
            .fetcher
            .fetch_additional_files(cancel, &task.repository, &task.path)
            .await?;
        let dir = self.temp_dir()?;
        debug!(
            repository = %task.repository.name,
            path = %task.path,
            dir = %dir.path().display(),
            "creating workspace"
        );

        let workspace = Workspace::prepare(
            cancel,
            dir,
            &archive,
            additional_files,
            &task.path,
            Arc::clone(&self.runtime),
            self.container.clone(),
        )
        .await;
        self.fetcher.release(&archive).await;
        workspace
    }
}
