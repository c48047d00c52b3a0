//! Materialized checkout of one task.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::hash::{Hash as _, Hasher as _};
use std::io::{Error as IoError, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batch_core::{ChangedFiles, ContainerConfig, WorkspaceError};
use flate2::read::GzDecoder;
use tar::Archive;
use tempfile::TempDir;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use crate::Result;
use crate::process::{ProcessOutput, ProcessRuntime, ProcessSpec, container_spec};

/// Content fingerprints keyed by repository-relative path.
type Fingerprints = HashMap<String, u64>;

/// Identity used for the bookkeeping commit.
const GIT_IDENTITY: [&str; 6] = [
    "-c",
    "user.name=batch-exec",
    "-c",
    "user.email=batch-exec@localhost",
    "-c",
    "commit.gpgsign=false",
];

/// Temporary directory holding the unpacked repository subtree plus a git
/// repository whose only commit is the pristine state.
///
/// Steps run in `<root>/<path>`. The directory is removed by [`Self::close`]
/// or, failing that, when the workspace is dropped.
pub struct Workspace {
    dir: TempDir,
    path: String,
    runtime: Arc<dyn ProcessRuntime>,
    container: ContainerConfig,
    baseline: Fingerprints,
}

impl Workspace {
    /// Unpack `archive` into `dir`, write `additional_files` and commit the
    /// result as the pristine state.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::Extract`] if the archive is not a valid
    /// gzip-compressed tar and [`WorkspaceError::Vcs`] if git fails.
    pub async fn prepare(
        cancel: &CancellationToken,
        dir: TempDir,
        archive: &Path,
        additional_files: Vec<(String, Vec<u8>)>,
        path: &str,
        runtime: Arc<dyn ProcessRuntime>,
        container: ContainerConfig,
    ) -> Result<Self> {
        let root = dir.path().to_path_buf();
        let source = archive.to_path_buf();
        spawn_blocking(move || unpack(&source, &root, &additional_files))
            .await
            .map_err(|error| WorkspaceError::Extract(IoError::other(error)))?
            .map_err(WorkspaceError::Extract)?;

        let mut workspace = Self {
            dir,
            path: path.to_owned(),
            runtime,
            container,
            baseline: Fingerprints::new(),
        };
        fs::create_dir_all(workspace.work_dir())?;

        workspace.git(cancel, &["init", "--quiet"]).await?;
        workspace
            .git(cancel, &["add", "--all", "--force", "--", "."])
            .await?;
        let mut commit = GIT_IDENTITY.to_vec();
        commit.extend(["commit", "--quiet", "--allow-empty", "--no-verify", "-m", "pristine"]);
        workspace.git(cancel, &commit).await?;

        workspace.baseline = workspace.fingerprint().await?;
        debug!(
            root = %workspace.root().display(),
            files = workspace.baseline.len(),
            "workspace prepared"
        );
        Ok(workspace)
    }

    /// Root of the checkout.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Sub-path the task operates on; empty for the repository root.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Directory steps run in.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        if self.path.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(&self.path)
        }
    }

    /// Run a rendered step command, in `image` if given.
    ///
    /// The output is returned whatever the exit code; callers decide whether
    /// a non-zero exit fails the step.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::Process`] if the command cannot be launched,
    /// was cancelled or could not be terminated.
    pub async fn apply_step(
        &self,
        cancel: &CancellationToken,
        command: &str,
        image: Option<&str>,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessOutput> {
        let spec = match image {
            Some(image) => {
                container_spec(&self.container, image, self.root(), &self.path, command, env)
            }
            None => ProcessSpec::shell(command, self.work_dir()).envs(env),
        };
        Ok(self.runtime.run(spec, cancel).await?)
    }

    /// Files added, modified and deleted since the previous call (since the
    /// pristine state on the first call). Paths are relative to the root.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::Io`] if the tree cannot be read.
    pub async fn changed_files(&mut self) -> Result<ChangedFiles> {
        let current = self.fingerprint().await?;
        let changes = compare(&self.baseline, &current);
        self.baseline = current;
        trace!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            deleted = changes.deleted.len(),
            "changed files"
        );
        Ok(changes)
    }

    /// Unified diff of the task's sub-path against the pristine state.
    ///
    /// # Errors
    /// Returns [`WorkspaceError::Vcs`] if git fails.
    pub async fn diff(&self, cancel: &CancellationToken) -> Result<String> {
        let pathspec = if self.path.is_empty() {
            "."
        } else {
            self.path.as_str()
        };
        self.git(cancel, &["add", "--all", "--", pathspec]).await?;
        self.git(
            cancel,
            &[
                "diff",
                "--cached",
                "--no-prefix",
                "--binary",
                "--no-renames",
                "--no-color",
                "--",
                pathspec,
            ],
        )
        .await
    }

    /// Remove the directory. Failures are logged, not returned.
    pub fn close(self) {
        let root = self.root().to_path_buf();
        if let Err(error) = self.dir.close() {
            warn!(root = %root.display(), %error, "failed to remove workspace");
        }
    }

    async fn git(&self, cancel: &CancellationToken, args: &[&str]) -> Result<String> {
        let spec = ProcessSpec::new("git", self.root())
            .args(args.iter().copied())
            .envs(&git_env());
        let output = self.runtime.run(spec, cancel).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(WorkspaceError::Vcs {
                command: format!("git {}", args.join(" ")),
                exit_code: output.code(),
                stderr: output.stderr,
            })
        }
    }

    async fn fingerprint(&self) -> Result<Fingerprints> {
        let root = self.root().to_path_buf();
        Ok(spawn_blocking(move || fingerprint(&root))
            .await
            .map_err(IoError::other)??)
    }
}

fn git_env() -> BTreeMap<String, String> {
    [
        ("GIT_CONFIG_NOSYSTEM", "1"),
        ("GIT_TERMINAL_PROMPT", "0"),
        ("LC_ALL", "C"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value.to_owned()))
    .collect()
}

fn unpack(archive: &Path, root: &Path, additional_files: &[(String, Vec<u8>)]) -> IoResult<()> {
    let mut entries = Archive::new(GzDecoder::new(File::open(archive)?));
    entries.set_preserve_permissions(true);
    entries.unpack(root)?;

    for (name, content) in additional_files {
        let target = root.join(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, content)?;
    }
    Ok(())
}

fn fingerprint(root: &Path) -> IoResult<Fingerprints> {
    let mut fingerprints = Fingerprints::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git");

    for entry in walker {
        let entry = entry.map_err(|error| {
            error
                .into_io_error()
                .unwrap_or_else(|| IoError::other("filesystem loop"))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let content = if entry.file_type().is_symlink() {
            fs::read_link(entry.path())?.into_os_string().into_encoded_bytes()
        } else {
            fs::read(entry.path())?
        };
        fingerprints.insert(name, hash_content(&content));
    }
    Ok(fingerprints)
}

fn hash_content(content: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

fn compare(before: &Fingerprints, after: &Fingerprints) -> ChangedFiles {
    let mut changes = ChangedFiles::default();
    for (name, hash) in after {
        match before.get(name) {
            None => changes.added.push(name.clone()),
            Some(previous) if previous != hash => changes.modified.push(name.clone()),
            Some(_) => {}
        }
    }
    changes.deleted = before
        .keys()
        .filter(|name| !after.contains_key(*name))
        .cloned()
        .collect();
    changes.added.sort();
    changes.modified.sort();
    changes.deleted.sort();
    changes
}
