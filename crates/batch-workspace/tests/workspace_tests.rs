//! Integration tests for workspace creation, step application and diffing
//!
//! These tests need `git` and `sh` on `PATH`.

#![cfg(test)]
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Test code is allowed to use expect/unwrap and doesn't need panic docs"
)]

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use batch_core::{
    BatchChangeAttributes, ExecutorConfig, Repository, Step, Task, WorkspaceError,
    diff_file_names,
};
use batch_workspace::{
    ArchiveFetcher, ArchiveSource, LocalWorkspaceCreator, WorkspaceCreator as _,
};
use common::{MemorySource, init_tracing};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REPO: &str = "github.com/sourcegraph/src-cli";

fn creator(source: impl Into<Arc<MemorySource>>, cache: &TempDir) -> LocalWorkspaceCreator {
    let mut config = ExecutorConfig::default();
    config.workspace.cache_dir = cache.path().join("archives");
    config.workspace.temp_dir = Some(cache.path().join("workspaces"));
    let source: Arc<MemorySource> = source.into();
    LocalWorkspaceCreator::from_config(source as Arc<dyn ArchiveSource>, &config)
}

fn task(path: &str) -> Task {
    Task::new(
        Repository::new(REPO, "main"),
        path,
        Arc::from(vec![Step::new("true")]),
        BatchChangeAttributes::default(),
    )
}

#[tokio::test]
async fn test_untouched_workspace_has_empty_diff() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let source = MemorySource::default().with_archive(
        REPO,
        "",
        &[("README.md", "# Welcome"), ("main.go", "package main\n")],
    );
    let cancel = CancellationToken::new();

    let mut workspace = creator(source, &cache)
        .create(&cancel, &task(""))
        .await
        .expect("create workspace");
    assert_eq!(
        fs::read_to_string(workspace.root().join("README.md")).expect("read README"),
        "# Welcome"
    );

    let output = workspace
        .apply_step(&cancel, "true", None, &BTreeMap::new())
        .await
        .expect("run step");
    assert!(output.success());
    assert!(workspace.changed_files().await.expect("changed files").is_empty());
    assert_eq!(workspace.diff(&cancel).await.expect("diff"), "");
    workspace.close();
}

#[tokio::test]
async fn test_changed_files_are_incremental() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let source = MemorySource::default().with_archive(
        REPO,
        "",
        &[
            ("README.md", "line 1"),
            ("main.go", "package main\n"),
            ("old.txt", "x"),
        ],
    );
    let cancel = CancellationToken::new();
    let env = BTreeMap::new();

    let mut workspace = creator(source, &cache)
        .create(&cancel, &task(""))
        .await
        .expect("create workspace");

    workspace
        .apply_step(
            &cancel,
            "echo 'line 2' >> README.md && touch new.txt && rm old.txt",
            None,
            &env,
        )
        .await
        .expect("first step");
    let first = workspace.changed_files().await.expect("changed files");
    assert_eq!(first.added, vec!["new.txt"]);
    assert_eq!(first.modified, vec!["README.md"]);
    assert_eq!(first.deleted, vec!["old.txt"]);

    workspace
        .apply_step(&cancel, "echo 'func main() {}' >> main.go", None, &env)
        .await
        .expect("second step");
    let second = workspace.changed_files().await.expect("changed files");
    assert!(second.added.is_empty());
    assert_eq!(second.modified, vec!["main.go"]);
    assert!(second.deleted.is_empty());

    let diff = workspace.diff(&cancel).await.expect("diff");
    assert_eq!(
        diff_file_names(&diff),
        vec!["README.md", "main.go", "new.txt", "old.txt"]
    );
    assert!(diff.contains("+line 2"));
    workspace.close();
}

#[tokio::test]
async fn test_sub_path_diff_excludes_outside_files() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let source = MemorySource::default()
        .with_archive(REPO, "a/b", &[("a/b/hello.txt", "hi")])
        .with_file(REPO, ".gitignore", "*.log\n")
        .with_file(REPO, "a/.gitignore", "*.tmp\n");
    let cancel = CancellationToken::new();
    let env = BTreeMap::new();

    let mut workspace = creator(source, &cache)
        .create(&cancel, &task("a/b"))
        .await
        .expect("create workspace");
    assert!(workspace.work_dir().ends_with("a/b"));
    assert!(workspace.root().join(".gitignore").exists());
    assert!(workspace.root().join("a/.gitignore").exists());

    workspace
        .apply_step(
            &cancel,
            "touch in-path.txt debug.log && echo outside > ../../outside.txt",
            None,
            &env,
        )
        .await
        .expect("step");

    let changes = workspace.changed_files().await.expect("changed files");
    assert_eq!(
        changes.added,
        vec!["a/b/debug.log", "a/b/in-path.txt", "outside.txt"]
    );

    let diff = workspace.diff(&cancel).await.expect("diff");
    assert_eq!(diff_file_names(&diff), vec!["a/b/in-path.txt"]);
    workspace.close();
}

#[tokio::test]
async fn test_failing_command_returns_output() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let source = MemorySource::default().with_archive(REPO, "", &[("README.md", "x")]);
    let cancel = CancellationToken::new();

    let workspace = creator(source, &cache)
        .create(&cancel, &task(""))
        .await
        .expect("create workspace");
    let mut env = BTreeMap::new();
    env.insert("REASON".to_owned(), "broken".to_owned());
    let output = workspace
        .apply_step(&cancel, "echo \"$REASON\" >&2; exit 7", None, &env)
        .await
        .expect("step");
    assert_eq!(output.code(), 7);
    assert_eq!(output.stderr, "broken\n");
    workspace.close();
}

#[tokio::test]
async fn test_missing_archive_fails_creation() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let outcome = creator(MemorySource::default(), &cache)
        .create(&CancellationToken::new(), &task(""))
        .await;
    assert!(matches!(outcome, Err(WorkspaceError::Fetch(_))));
}

#[tokio::test]
async fn test_corrupt_archive_fails_extraction() {
    init_tracing();
    let cache = TempDir::new().expect("Failed to create temp dir");
    let source = Arc::new(MemorySource::default().with_archive(REPO, "", &[]));
    let archive = ArchiveFetcher::new(
        Arc::clone(&source) as Arc<dyn ArchiveSource>,
        cache.path().join("archives"),
    )
    .archive_path(&Repository::new(REPO, "main"), "");
    fs::create_dir_all(cache.path().join("archives")).expect("create cache dir");
    fs::write(&archive, b"not a tarball").expect("write corrupt archive");

    let outcome = creator(source, &cache)
        .create(&CancellationToken::new(), &task(""))
        .await;
    assert!(matches!(outcome, Err(WorkspaceError::Extract(_))));
}
