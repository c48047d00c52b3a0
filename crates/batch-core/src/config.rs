//! Configuration types for execution, workspaces, containers and processes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete executor configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Scheduling configuration
    pub execution: ExecutionConfig,
    /// Workspace and archive cache configuration
    pub workspace: WorkspaceConfig,
    /// Container runtime configuration
    pub container: ContainerConfig,
    /// Process termination configuration
    pub process: ProcessConfig,
}

/// Scheduling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum number of tasks executed concurrently
    pub parallelism: usize,
    /// Per-task timeout in milliseconds; `0` disables the timeout
    pub timeout_ms: u64,
    /// Cancel the remaining tasks as soon as one fails
    pub fail_fast: bool,
    /// Report task failures through statuses only and return the successful results
    pub skip_errors: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: num_cpus::get().max(1),
            timeout_ms: 60 * 60 * 1000,
            fail_fast: false,
            skip_errors: false,
        }
    }
}

impl ExecutionConfig {
    /// The per-task timeout, if enabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory for task workspaces; the system temp dir if unset
    pub temp_dir: Option<PathBuf>,
    /// Directory holding downloaded archives
    pub cache_dir: PathBuf,
    /// Keep downloaded archives after the workspace was created
    pub keep_archives: bool,
    /// Fetch `.gitignore`/`.gitattributes` of parent directories for sub-path tasks
    pub fetch_additional_files: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join("batch-exec")
                .join("archives"),
            keep_archives: false,
            fetch_additional_files: true,
        }
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI used to run containerized steps
    pub runtime: String,
    /// Mount point of the workspace inside the container
    pub work_dir: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_owned(),
            work_dir: "/work".to_owned(),
        }
    }
}

/// Process termination configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Interval between exit checks while terminating a process, in milliseconds
    pub poll_interval_ms: u64,
    /// Time after which termination escalates to a forced kill, in milliseconds
    pub grace_period_ms: u64,
    /// Overall time allowed to confirm a process exited, in milliseconds
    pub termination_deadline_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            grace_period_ms: 500,
            termination_deadline_ms: 10_000,
        }
    }
}

impl ExecutorConfig {
    /// Get the default config directory path (`~/.batch-exec`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".batch-exec"))
    }

    /// Get the default config file path (`~/.batch-exec/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location, creating it with default
    /// values if it does not exist
    ///
    /// # Errors
    /// Returns an error if the config cannot be read or created
    pub fn load_or_create() -> Result<Self, ConfigError> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let header = "# Batch executor configuration\n\
                      # This file is automatically generated on first run\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert!(config.execution.parallelism >= 1);
        assert!(!config.execution.fail_fast);
        assert_eq!(config.container.runtime, "docker");
        assert_eq!(config.process.poll_interval_ms, 10);
    }

    #[test]
    fn test_timeout_zero_disables() {
        let execution = ExecutionConfig {
            timeout_ms: 0,
            ..ExecutionConfig::default()
        };
        assert_eq!(execution.timeout(), None);

        let execution = ExecutionConfig {
            timeout_ms: 250,
            ..ExecutionConfig::default()
        };
        assert_eq!(execution.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: ExecutorConfig = match toml::from_str("[execution]\nfail_fast = true\n") {
            Ok(config) => config,
            Err(error) => panic!("parse failed: {error}"),
        };
        assert!(parsed.execution.fail_fast);
        assert_eq!(parsed.container, ContainerConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("tempdir failed: {error}"),
        };
        let path = dir.path().join("nested").join("config.toml");
        let mut config = ExecutorConfig::default();
        config.execution.parallelism = 3;
        config.workspace.keep_archives = true;

        if let Err(error) = config.save_to_file(&path) {
            panic!("save failed: {error}");
        }
        let loaded = match ExecutorConfig::load_from_file(&path) {
            Ok(loaded) => loaded,
            Err(error) => panic!("load failed: {error}"),
        };
        assert_eq!(loaded, config);
    }
}
