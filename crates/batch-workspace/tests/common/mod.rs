//! Common test utilities for batch-workspace tests
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
use std::sync::Once;

use async_trait::async_trait;
use batch_core::{FetchError, Repository};
use batch_workspace::ArchiveSource;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, Header};
use tracing_subscriber::{EnvFilter, fmt};

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
