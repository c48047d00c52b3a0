//! Per-task step execution context.
//!
//! The context only ever grows: each completed (or skipped) step appends one
//! [`StepSlot`], and declared outputs are merged into the global outputs map.
//! Both operations consume the context and return the next one, so a step can
//! never observe state from a step that has not finished yet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Repository attributes visible as `repository.*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryAttributes {
    /// Repository name, e.g. `github.com/org/repo`.
    pub name: String,
    /// Revision the archive was fetched at.
    pub revision: String,
}

/// Batch change attributes visible as `batch_change.*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchChangeAttributes {
    /// Name of the batch change.
    pub name: String,
    /// Description of the batch change.
    pub description: String,
    /// Author recorded on generated commits.
    pub author: String,
}

/// Recorded outcome of one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSlot {
    /// Optional step name for `steps.<name>` lookups.
    pub name: Option<String>,
    /// Whether the step was skipped by its condition.
    pub skipped: bool,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Files created by this step.
    pub added_files: Vec<String>,
    /// Files whose content this step changed.
    pub modified_files: Vec<String>,
    /// Files this step removed.
    pub deleted_files: Vec<String>,
}

impl StepSlot {
    /// Slot for a step that did not run.
    #[must_use]
    pub fn skipped(name: Option<String>) -> Self {
        Self {
            name,
            skipped: true,
            ..Self::default()
        }
    }

    /// All files this step touched, sorted and deduplicated.
    #[must_use]
    pub fn changed_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .added_files
            .iter()
            .chain(&self.modified_files)
            .chain(&self.deleted_files)
            .cloned()
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Values available to step templates of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContext {
    repository: RepositoryAttributes,
    batch_change: BatchChangeAttributes,
    steps: Vec<StepSlot>,
    outputs: BTreeMap<String, Value>,
}

impl StepContext {
    /// Context for a task before its first step.
    #[must_use]
    pub fn new(repository: RepositoryAttributes, batch_change: BatchChangeAttributes) -> Self {
        Self {
            repository,
            batch_change,
            steps: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Append the slot of a finished step.
    #[must_use]
    pub fn with_step(mut self, slot: StepSlot) -> Self {
        self.steps.push(slot);
        self
    }

    /// Merge outputs; a later step overwrites earlier values of the same name.
    #[must_use]
    pub fn with_outputs<I>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.outputs.extend(outputs);
        self
    }

    /// Repository attributes.
    #[must_use]
    pub fn repository(&self) -> &RepositoryAttributes {
        &self.repository
    }

    /// Batch change attributes.
    #[must_use]
    pub fn batch_change(&self) -> &BatchChangeAttributes {
        &self.batch_change
    }

    /// Slots of all finished steps, in execution order.
    #[must_use]
    pub fn steps(&self) -> &[StepSlot] {
        &self.steps
    }

    /// Slot of the step that finished last.
    #[must_use]
    pub fn previous_step(&self) -> Option<&StepSlot> {
        self.steps.last()
    }

    /// Most recent slot recorded under `name`.
    #[must_use]
    pub fn named_step(&self, name: &str) -> Option<&StepSlot> {
        self.steps
            .iter()
            .rev()
            .find(|slot| slot.name.as_deref() == Some(name))
    }

    /// Global outputs accumulated so far.
    #[must_use]
    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository() -> RepositoryAttributes {
        RepositoryAttributes {
            name: "github.com/org/repo".to_owned(),
            revision: "abc123".to_owned(),
        }
    }

    #[test]
    fn test_previous_step_tracks_last_slot() {
        let context = StepContext::new(repository(), BatchChangeAttributes::default());
        assert!(context.previous_step().is_none());

        let context = context
            .with_step(StepSlot {
                stdout: "first".to_owned(),
                ..StepSlot::default()
            })
            .with_step(StepSlot::skipped(None));

        let previous = context.previous_step().map(|slot| slot.skipped);
        assert_eq!(previous, Some(true));
        assert_eq!(context.steps().len(), 2);
    }

    #[test]
    fn test_outputs_later_step_wins() {
        let context = StepContext::new(repository(), BatchChangeAttributes::default())
            .with_outputs([("name".to_owned(), Value::from("first"))])
            .with_outputs([("name".to_owned(), Value::from("second"))]);
        assert_eq!(context.outputs().get("name"), Some(&Value::from("second")));
    }

    #[test]
    fn test_named_step_lookup() {
        let context = StepContext::new(repository(), BatchChangeAttributes::default())
            .with_step(StepSlot {
                name: Some("format".to_owned()),
                stdout: "formatted".to_owned(),
                ..StepSlot::default()
            })
            .with_step(StepSlot::default());
        let stdout = context.named_step("format").map(|slot| slot.stdout.as_str());
        assert_eq!(stdout, Some("formatted"));
        assert!(context.named_step("missing").is_none());
    }

    #[test]
    fn test_changed_files_union() {
        let slot = StepSlot {
            added_files: vec!["b.txt".to_owned()],
            modified_files: vec!["a.txt".to_owned()],
            deleted_files: vec!["c.txt".to_owned(), "a.txt".to_owned()],
            ..StepSlot::default()
        };
        assert_eq!(slot.changed_files(), vec!["a.txt", "b.txt", "c.txt"]);
    }
}
