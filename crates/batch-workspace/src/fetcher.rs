//! Repository archive download and on-disk caching.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash as _, Hasher as _};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use batch_core::{FetchError, IgnoreLock as _, Repository, WorkspaceConfig};
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Files fetched next to a sub-path archive so the workspace keeps the
/// repository's ignore and attribute rules.
const ADDITIONAL_FILES: [&str; 2] = [".gitignore", ".gitattributes"];

/// Remote that serves repository snapshots.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Gzip-compressed tar archive of `path` (the root when empty) at the
    /// repository's revision. Entry names are relative to the repository root.
    ///
    /// # Errors
    /// Returns [`FetchError::NotFound`] if the remote has no such archive and
    /// [`FetchError::Network`] if the remote could not be reached.
    async fn fetch_archive(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<u8>, FetchError>;

    /// Raw content of a single file, `None` if it does not exist.
    ///
    /// # Errors
    /// Returns [`FetchError::Network`] if the remote could not be reached.
    async fn fetch_file(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Option<Vec<u8>>, FetchError>;
}

/// Cache key of one archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ArchiveKey {
    repository: String,
    revision: String,
    path: String,
}

impl ArchiveKey {
    fn new(repository: &Repository, path: &str) -> Self {
        Self {
            repository: repository.id.clone(),
            revision: repository.revision.clone(),
            path: path.to_owned(),
        }
    }

    /// Sanitized repository prefix plus a hash of the whole key; distinct keys
    /// never share a file even when their sanitized names agree.
    fn file_name(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{}-{:016x}.tar.gz", sanitize(&self.repository), hasher.finish())
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '_') {
                character
            } else {
                '-'
            }
        })
        .collect()
}

type SharedFetch = Shared<BoxFuture<'static, Result<PathBuf, FetchError>>>;

/// Downloads archives once per (repository, revision, path) and keeps them on
/// disk under the cache directory.
///
/// Concurrent requests for the same key await one shared download; different
/// keys never wait on each other.
pub struct ArchiveFetcher {
    source: Arc<dyn ArchiveSource>,
    cache_dir: PathBuf,
    keep_archives: bool,
    fetch_additional_files: bool,
    in_flight: Arc<Mutex<HashMap<ArchiveKey, SharedFetch>>>,
}

impl ArchiveFetcher {
    /// Create a fetcher caching into `cache_dir`.
    #[must_use]
    pub fn new(source: Arc<dyn ArchiveSource>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            cache_dir: cache_dir.into(),
            keep_archives: false,
            fetch_additional_files: true,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a fetcher from the `[workspace]` configuration section.
    #[must_use]
    pub fn from_config(source: Arc<dyn ArchiveSource>, config: &WorkspaceConfig) -> Self {
        Self::new(source, config.cache_dir.clone())
            .with_keep_archives(config.keep_archives)
            .with_additional_files(config.fetch_additional_files)
    }

    /// Keep archives on disk after the workspace was created.
    #[must_use]
    pub fn with_keep_archives(mut self, keep_archives: bool) -> Self {
        self.keep_archives = keep_archives;
        self
    }

    /// Toggle fetching ancestor `.gitignore`/`.gitattributes` files.
    #[must_use]
    pub fn with_additional_files(mut self, enabled: bool) -> Self {
        self.fetch_additional_files = enabled;
        self
    }

    /// Directory archives are cached in.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Location of the cached archive for `path` of `repository`.
    #[must_use]
    pub fn archive_path(&self, repository: &Repository, path: &str) -> PathBuf {
        self.cache_dir.join(ArchiveKey::new(repository, path).file_name())
    }

    /// Path of the cached archive for `path` of `repository`, downloading it
    /// first if needed.
    ///
    /// The download runs on its own task, so a caller that gives up on
    /// `cancel` leaves it to finish into the cache. The in-flight entry is
    /// removed when the download ends; failures are not cached.
    ///
    /// # Errors
    /// Returns the source's [`FetchError`], [`FetchError::Cache`] if the archive
    /// cannot be written and [`FetchError::Cancelled`] if `cancel` fires first.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        repository: &Repository,
        path: &str,
    ) -> Result<PathBuf, FetchError> {
        let key = ArchiveKey::new(repository, path);
        let shared = {
            let mut in_flight = self.in_flight.lock_ignore_poison();
            in_flight
                .entry(key.clone())
                .or_insert_with(|| self.spawn_download(key, repository.clone()))
                .clone()
        };

        tokio::select! {
            outcome = shared => outcome,
            () = cancel.cancelled() => Err(FetchError::Cancelled {
                repository: repository.name.clone(),
            }),
        }
    }

    fn spawn_download(&self, key: ArchiveKey, repository: Repository) -> SharedFetch {
        let source = Arc::clone(&self.source);
        let target = self.cache_dir.join(key.file_name());
        let cache_dir = self.cache_dir.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let name = repository.name.clone();

        let handle = tokio::spawn(async move {
            let outcome =
                download(source.as_ref(), &repository, &key.path, &cache_dir, target).await;
            // Only this task inserted the entry, and nothing else removes it.
            in_flight.lock_ignore_poison().remove(&key);
            outcome
        });

        async move {
            handle.await.map_err(|error| FetchError::Cache {
                repository: name,
                message: error.to_string(),
            })?
        }
        .boxed()
        .shared()
    }

    /// Ancestor `.gitignore` and `.gitattributes` files of a sub-path, as
    /// (repository-relative path, content) pairs. Empty for the root.
    ///
    /// # Errors
    /// Returns the source's [`FetchError`] and [`FetchError::Cancelled`] if
    /// `cancel` fires first; files that do not exist are skipped.
    pub async fn fetch_additional_files(
        &self,
        cancel: &CancellationToken,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, FetchError> {
        if path.is_empty() || !self.fetch_additional_files {
            return Ok(Vec::new());
        }

        tokio::select! {
            files = self.collect_additional_files(repository, path) => files,
            () = cancel.cancelled() => Err(FetchError::Cancelled {
                repository: repository.name.clone(),
            }),
        }
    }

    async fn collect_additional_files(
        &self,
        repository: &Repository,
        path: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, FetchError> {
        let mut files = Vec::new();
        for directory in ancestors(path) {
            for name in ADDITIONAL_FILES {
                let file = if directory.is_empty() {
                    name.to_owned()
                } else {
                    format!("{directory}/{name}")
                };
                if let Some(content) = self.source.fetch_file(repository, &file).await? {
                    trace!(repository = %repository.name, file = %file, "fetched additional file");
                    files.push((file, content));
                }
            }
        }
        Ok(files)
    }

    /// Drop a cached archive unless archives are kept.
    pub async fn release(&self, archive: &Path) {
        if self.keep_archives {
            return;
        }
        if let Err(error) = fs::remove_file(archive).await {
            warn!(archive = %archive.display(), %error, "failed to remove cached archive");
        }
    }
}

async fn download(
    source: &dyn ArchiveSource,
    repository: &Repository,
    path: &str,
    cache_dir: &Path,
    target: PathBuf,
) -> Result<PathBuf, FetchError> {
    if fs::try_exists(&target).await.unwrap_or(false) {
        trace!(archive = %target.display(), "archive cache hit");
        return Ok(target);
    }

    debug!(repository = %repository.name, path, "downloading archive");
    let bytes = source.fetch_archive(repository, path).await?;

    let cache_error = |error: IoError| FetchError::Cache {
        repository: repository.name.clone(),
        message: error.to_string(),
    };
    fs::create_dir_all(cache_dir).await.map_err(cache_error)?;
    let partial = target.with_extension("part");
    fs::write(&partial, &bytes).await.map_err(cache_error)?;
    fs::rename(&partial, &target).await.map_err(cache_error)?;
    debug!(archive = %target.display(), size = bytes.len(), "archive cached");
    Ok(target)
}

/// Strict ancestors of `path`, root first: `a/b/c` yields `""`, `a`, `a/b`.
fn ancestors(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    (0..segments.len())
        .map(|depth| segments[..depth].join("/"))
        .collect()
}
