//! Common test utilities for batch-executor tests
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use batch_core::{
    BatchChangeAttributes, ExecutorConfig, ExecutorError, FetchError, Repository, Step, Task,
    TaskResult, TaskStatusCollection,
};
use batch_executor::{Executor, ExecutorOptions};
use batch_workspace::{ArchiveSource, LocalWorkspaceCreator};
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, Header};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

pub const REPO_A: &str = "github.com/sourcegraph/src-cli";
pub const REPO_B: &str = "github.com/sourcegraph/sourcegraph";

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (idempotent).
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_owned());
        if fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_test_writer()
            .try_init()
            .is_err()
        {
            // tracing already initialized in this process
        }
    });
}

/// Build a gzip-compressed tar archive holding `files`.
pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in files {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, content.as_bytes())
            .expect("append tar entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

/// Archive source serving prepared archives from memory.
#[derive(Default)]
pub struct MemorySource {
    archives: HashMap<(String, String), Vec<u8>>,
    files: HashMap<(String, String), Vec<u8>>,
}

impl MemorySource {
    /// Serve `files` as the archive of `path` in `repository`.
    pub fn with_archive(mut self, repository: &str, path: &str, files: &[(&str, &str)]) -> Self {
        self.archives
            .insert((repository.to_owned(), path.to_owned()), tar_gz(files));
        self
    }

    /// Serve a single file of `repository`.
    pub fn with_file(mut self, repository: &str, path: &str, content: &str) -> Self {
        self.files.insert(
            (repository.to_owned(), path.to_owned()),
            content.as_bytes().to_vec(),
        );
        self
    }
}

#[async_trait]
impl ArchiveSource for MemorySource {
    async fn fetch_archive(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<u8>, FetchError> {
        self.archives
            .get(&(repository.name.clone(), path.to_owned()))
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                repository: repository.name.clone(),
                revision: repository.revision.clone(),
                path: path.to_owned(),
            })
    }

    async fn fetch_file(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Option<Vec<u8>>, FetchError> {
        Ok(self
            .files
            .get(&(repository.name.clone(), path.to_owned()))
            .cloned())
    }
}

/// Batch change attributes shared by all test tasks.
pub fn batch_change() -> BatchChangeAttributes {
    BatchChangeAttributes {
        name: "my-change".to_owned(),
        description: "Test batch change".to_owned(),
        author: "Batch Tester".to_owned(),
    }
}

/// Tasks running `steps` against each (repository, path) pair.
pub fn tasks(targets: &[(&str, &str)], steps: Vec<Step>) -> Vec<Task> {
    let steps: Arc<[Step]> = Arc::from(steps);
    targets
        .iter()
        .map(|(repository, path)| {
            Task::new(
                Repository::new(*repository, "main"),
                *path,
                Arc::clone(&steps),
                batch_change(),
            )
        })
        .collect()
}

/// Options with a small worker pool and no timeout.
pub fn options() -> ExecutorOptions {
    ExecutorOptions {
        parallelism: 4,
        timeout: None,
        fail_fast: false,
        skip_errors: false,
    }
}

/// Outcome of one executor run.
pub struct Run {
    pub outcome: Result<Vec<TaskResult>, ExecutorError>,
    pub statuses: Arc<TaskStatusCollection>,
    pub elapsed: Duration,
    _dir: TempDir,
}

/// Execute `tasks` against `source` and wait for the outcome.
pub async fn execute(source: MemorySource, options: ExecutorOptions, tasks: Vec<Task>) -> Run {
    execute_with(source, options, tasks, CancellationToken::new()).await
}

/// Execute `tasks`, waiting on `cancel`.
pub async fn execute_with(
    source: MemorySource,
    options: ExecutorOptions,
    tasks: Vec<Task>,
    cancel: CancellationToken,
) -> Run {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = ExecutorConfig::default();
    config.workspace.cache_dir = dir.path().join("archives");
    config.workspace.temp_dir = Some(dir.path().join("workspaces"));
    config.process.grace_period_ms = 200;

    let creator = LocalWorkspaceCreator::from_config(
        Arc::new(source) as Arc<dyn ArchiveSource>,
        &config,
    );
    let statuses = Arc::new(TaskStatusCollection::new());
    let mut executor = Executor::new(options, Arc::new(creator));

    let started = Instant::now();
    executor.start(&cancel, tasks, Arc::clone(&statuses));
    let outcome = executor.wait(&cancel).await;
    Run {
        outcome,
        statuses,
        elapsed: started.elapsed(),
        _dir: dir,
    }
}

/// Files changed by the result for `repository` at `path`.
pub fn files_for(results: &[TaskResult], repository: &str, path: &str) -> Vec<String> {
    results
        .iter()
        .find(|result| result.task.repository.name == repository && result.task.path == path)
        .map(TaskResult::changed_files)
        .unwrap_or_else(|| panic!("no result for {repository} at `{path}`"))
}
