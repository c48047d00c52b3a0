//! Observer-facing registry of task lifecycle states.
//!
//! The executor is the only writer. Progress reporters read snapshots and may
//! await [`TaskStatusCollection::subscribe`] to be woken on every change.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

use crate::sync::IgnoreRwLock as _;
use crate::types::{Task, TaskId};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing the task.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

/// Progress record of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// Task identifier.
    pub task_id: TaskId,
    /// Repository name.
    pub repository: String,
    /// Sub-path inside the repository.
    pub path: String,
    /// Current state.
    pub state: TaskState,
    /// When the task was registered.
    pub enqueued_at: DateTime<Utc>,
    /// When a worker started it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it completed or failed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Label of the step being executed.
    pub current_step: Option<String>,
    /// Error message if the task failed.
    pub error: Option<String>,
    /// Number of files in the resulting diff.
    pub files_changed: usize,
}

impl TaskStatus {
    fn pending(task: &Task) -> Self {
        Self {
            task_id: task.id,
            repository: task.repository.name.clone(),
            path: task.path.clone(),
            state: TaskState::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            current_step: None,
            error: None,
            files_changed: 0,
        }
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Completed | TaskState::Failed)
    }

    /// Time between start and finish, or start and now while running.
    #[must_use]
    pub fn elapsed(&self) -> Option<TimeDelta> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or_else(Utc::now) - started)
    }
}

#[derive(Debug, Default)]
struct Registry {
    order: Vec<TaskId>,
    statuses: HashMap<TaskId, TaskStatus>,
}

/// Thread-safe collection of [`TaskStatus`] records, in registration order.
#[derive(Debug)]
pub struct TaskStatusCollection {
    registry: RwLock<Registry>,
    version: watch::Sender<u64>,
}

impl Default for TaskStatusCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStatusCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            registry: RwLock::new(Registry::default()),
            version,
        }
    }

    /// Register `task` as pending; a task registered twice is reset.
    pub fn register(&self, task: &Task) {
        {
            let mut registry = self.registry.write_ignore_poison();
            if !registry.statuses.contains_key(&task.id) {
                registry.order.push(task.id);
            }
            registry.statuses.insert(task.id, TaskStatus::pending(task));
        }
        self.notify();
    }

    /// Move a task to `Running`.
    pub fn mark_running(&self, task_id: TaskId) {
        self.update(task_id, |status| {
            status.state = TaskState::Running;
            status.started_at = Some(Utc::now());
        });
    }

    /// Record the step a running task is executing.
    pub fn set_current_step(&self, task_id: TaskId, label: String) {
        self.update(task_id, |status| status.current_step = Some(label));
    }

    /// Move a task to `Completed`.
    pub fn mark_completed(&self, task_id: TaskId, files_changed: usize) {
        self.update(task_id, |status| {
            status.state = TaskState::Completed;
            status.finished_at = Some(Utc::now());
            status.current_step = None;
            status.files_changed = files_changed;
        });
    }

    /// Move a task to `Failed`.
    pub fn mark_failed(&self, task_id: TaskId, error: String) {
        self.update(task_id, |status| {
            status.state = TaskState::Failed;
            status.finished_at = Some(Utc::now());
            status.error = Some(error);
        });
    }

    fn update(&self, task_id: TaskId, apply: impl FnOnce(&mut TaskStatus)) {
        let found = {
            let mut registry = self.registry.write_ignore_poison();
            registry.statuses.get_mut(&task_id).map(apply).is_some()
        };
        if found {
            self.notify();
        } else {
            trace!(%task_id, "status update for unregistered task ignored");
        }
    }

    fn notify(&self) {
        self.version.send_modify(|version| *version += 1);
    }

    /// Status of one task.
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.registry
            .read_ignore_poison()
            .statuses
            .get(&task_id)
            .cloned()
    }

    /// Copy of every status in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let registry = self.registry.read_ignore_poison();
        registry
            .order
            .iter()
            .filter_map(|task_id| registry.statuses.get(task_id).cloned())
            .collect()
    }

    /// Number of tasks in each state: (pending, running, completed, failed).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let registry = self.registry.read_ignore_poison();
        registry.statuses.values().fold(
            (0, 0, 0, 0),
            |(pending, running, completed, failed), status| match status.state {
                TaskState::Pending => (pending + 1, running, completed, failed),
                TaskState::Running => (pending, running + 1, completed, failed),
                TaskState::Completed => (pending, running, completed + 1, failed),
                TaskState::Failed => (pending, running, completed, failed + 1),
            },
        )
    }

    /// Receiver whose value changes on every status transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Repository, Step};
    use batch_template::BatchChangeAttributes;
    use std::sync::Arc;

    fn task(name: &str) -> Task {
        Task::new(
            Repository::new(name, "main"),
            "",
            Arc::from(vec![Step::new("true")]),
            BatchChangeAttributes::default(),
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let statuses = TaskStatusCollection::new();
        let first = task("repoA");
        let second = task("repoB");
        statuses.register(&first);
        statuses.register(&second);

        statuses.mark_running(first.id);
        statuses.set_current_step(first.id, "echo".to_owned());
        assert_eq!(
            statuses.get(first.id).and_then(|status| status.current_step),
            Some("echo".to_owned())
        );

        statuses.mark_completed(first.id, 3);
        statuses.mark_running(second.id);
        statuses.mark_failed(second.id, "boom".to_owned());

        let snapshot = statuses.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].repository, "repoA");
        assert_eq!(snapshot[0].state, TaskState::Completed);
        assert_eq!(snapshot[0].files_changed, 3);
        assert!(snapshot[0].current_step.is_none());
        assert_eq!(snapshot[1].state, TaskState::Failed);
        assert_eq!(snapshot[1].error.as_deref(), Some("boom"));
        assert!(snapshot.iter().all(TaskStatus::is_finished));
        assert_eq!(statuses.counts(), (0, 0, 1, 1));
    }

    #[test]
    fn test_unknown_task_is_ignored() {
        let statuses = TaskStatusCollection::new();
        statuses.mark_running(TaskId::new());
        assert!(statuses.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let statuses = TaskStatusCollection::new();
        let mut receiver = statuses.subscribe();
        let first = task("repoA");
        statuses.register(&first);
        statuses.mark_running(first.id);

        assert!(receiver.has_changed().unwrap_or(false));
        assert_eq!(*receiver.borrow_and_update(), 2);
    }
}
