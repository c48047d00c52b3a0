use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;
use std::time::Duration;

use batch_template::{BatchChangeAttributes, RepositoryAttributes, StepContext};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for TaskId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{}", self.0)
    }
}

/// Repository a task operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    /// Opaque identifier used by the remote archive source.
    pub id: String,
    /// Human readable name, e.g. `github.com/org/repo`.
    pub name: String,
    /// Commit or branch the archive is fetched at.
    pub revision: String,
}

impl Repository {
    /// Create a repository whose id equals its name.
    #[must_use]
    pub fn new(name: impl Into<String>, revision: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            revision: revision.into(),
        }
    }

    /// Template attributes exposed as `repository.*`.
    #[must_use]
    pub fn attributes(&self) -> RepositoryAttributes {
        RepositoryAttributes {
            name: self.name.clone(),
            revision: self.revision.clone(),
        }
    }
}

/// Condition deciding whether a step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// Skip the step when the template evaluates to `true`.
    SkipIf(String),
    /// Run the step only when the template evaluates to `true`.
    RunIf(String),
}

/// How a rendered output value is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Keep the rendered text.
    #[default]
    Text,
    /// Parse the rendered text as JSON (string, bool or list of strings).
    Json,
}

/// Declared output of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Template rendered after the step ran; may use `step.*`.
    pub value: String,
    /// Interpretation of the rendered text.
    #[serde(default)]
    pub format: OutputFormat,
}

impl OutputSpec {
    /// Plain text output.
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            format: OutputFormat::Text,
        }
    }

    /// Output parsed as JSON.
    #[must_use]
    pub fn json(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            format: OutputFormat::Json,
        }
    }
}

/// One executable step of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Optional name, exposed to later steps as `steps.<name>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Shell command template.
    pub run: String,
    /// Container image to run the command in.
    #[serde(default)]
    pub container: Option<String>,
    /// Condition evaluated before the command is rendered.
    #[serde(default)]
    pub condition: Option<StepCondition>,
    /// Environment variables; values are templates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Outputs folded into the global outputs map.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputSpec>,
}

impl Step {
    /// Step running `run` directly on the host.
    #[must_use]
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            ..Self::default()
        }
    }

    /// Name the step for `steps.<name>` lookups.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Run the command inside `image`.
    #[must_use]
    pub fn with_container(mut self, image: impl Into<String>) -> Self {
        self.container = Some(image.into());
        self
    }

    /// Skip the step when `condition` is true.
    #[must_use]
    pub fn skip_if(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(StepCondition::SkipIf(condition.into()));
        self
    }

    /// Run the step only when `condition` is true.
    #[must_use]
    pub fn run_if(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(StepCondition::RunIf(condition.into()));
        self
    }

    /// Set an environment variable template.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Declare an output.
    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, output: OutputSpec) -> Self {
        self.outputs.insert(name.into(), output);
        self
    }

    /// Short label for progress reporting.
    #[must_use]
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let first_line = self.run.lines().next().unwrap_or_default();
            first_line.chars().take(60).collect()
        })
    }
}

/// Immutable unit of work: run `steps` against `path` of `repository`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Target repository.
    pub repository: Repository,
    /// Sub-path inside the repository; the root is the empty string.
    pub path: String,
    /// Ordered steps, shared between tasks of the same batch change.
    pub steps: Arc<[Step]>,
    /// Shared batch change attributes.
    pub batch_change: BatchChangeAttributes,
}

impl Task {
    /// Create a task for `repository` at `path`.
    #[must_use]
    pub fn new(
        repository: Repository,
        path: impl Into<String>,
        steps: Arc<[Step]>,
        batch_change: BatchChangeAttributes,
    ) -> Self {
        Self {
            id: TaskId::new(),
            repository,
            path: normalize_path(&path.into()),
            steps,
            batch_change,
        }
    }

    /// Context before the first step.
    #[must_use]
    pub fn initial_context(&self) -> StepContext {
        StepContext::new(self.repository.attributes(), self.batch_change.clone())
    }

    /// `repository` or `repository (path)` for log and error messages.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.path.is_empty() {
            self.repository.name.clone()
        } else {
            format!("{} ({})", self.repository.name, self.path)
        }
    }
}

/// Strip leading/trailing separators and `.` so `./a/b/` becomes `a/b`.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Files a step changed, relative to the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFiles {
    /// Newly created files.
    pub added: Vec<String>,
    /// Files whose content changed.
    pub modified: Vec<String>,
    /// Removed files.
    pub deleted: Vec<String>,
}

impl ChangedFiles {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Successful outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task: Arc<Task>,
    /// Unified multi-file diff against the pristine checkout.
    pub diff: String,
    /// Context after the last step.
    pub context: StepContext,
    /// Wall clock time spent on the task.
    pub duration: Duration,
}

impl TaskResult {
    /// Paths of the files touched by [`Self::diff`].
    #[must_use]
    pub fn changed_files(&self) -> Vec<String> {
        diff_file_names(&self.diff)
    }
}

/// Extract file names from `diff --git` headers of a `--no-prefix` diff.
#[must_use]
pub fn diff_file_names(diff: &str) -> Vec<String> {
    let mut names: Vec<String> = diff
        .lines()
        .filter_map(|line| line.strip_prefix("diff --git "))
        .filter_map(|rest| {
            let half = rest.len().checked_sub(1)? / 2;
            let (left, right) = (rest.get(..half)?, rest.get(half + 1..)?);
            (left == right).then(|| left.to_owned())
        })
        .collect();
    names.sort();
    names.dedup();
    names
}
