//! Bounded-concurrency execution of tasks.
//!
//! [`Executor::start`] spawns a fixed pool of workers pulling tasks from a
//! shared queue. Each worker creates a workspace, runs the task's steps and
//! sends the outcome over a channel that [`Executor::wait`] drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use batch_core::{
    ExecutionConfig, ExecutorConfig, ExecutorError, FetchError, ProcessError, Step, StepContext,
    Task, TaskError, TaskErrorKind, TaskFailure, TaskResult, TaskStatusCollection, TimeoutError,
};
use batch_workspace::{Workspace, WorkspaceCreator};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::step_runner::StepRunner;

/// Scheduling options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of tasks running at once.
    pub parallelism: usize,
    /// Per-task timeout.
    pub timeout: Option<Duration>,
    /// Cancel all remaining tasks when one fails.
    pub fail_fast: bool,
    /// Return the successful results even if some tasks failed.
    pub skip_errors: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for ExecutorOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            timeout: config.timeout(),
            fail_fast: config.fail_fast,
            skip_errors: config.skip_errors,
        }
    }
}

impl From<&ExecutorConfig> for ExecutorOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self::from(&config.execution)
    }
}

enum TaskOutcome {
    Success(TaskResult),
    Failure(TaskFailure),
}

/// State shared by all workers of one run.
struct Worker {
    options: ExecutorOptions,
    creator: Arc<dyn WorkspaceCreator>,
    statuses: Arc<TaskStatusCollection>,
    cancel: CancellationToken,
}

struct Running {
    workers: JoinSet<()>,
    outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
    cancel: CancellationToken,
}

/// Runs tasks in parallel, each in its own workspace.
pub struct Executor {
    options: ExecutorOptions,
    creator: Arc<dyn WorkspaceCreator>,
    running: Option<Running>,
}

impl Executor {
    /// Create an executor; nothing runs until [`Self::start`].
    #[must_use]
    pub fn new(options: ExecutorOptions, creator: Arc<dyn WorkspaceCreator>) -> Self {
        Self {
            options,
            creator,
            running: None,
        }
    }

    /// Options in effect.
    #[must_use]
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Register `tasks` in `statuses` and start executing them.
    ///
    /// Cancelling `cancel` stops every task. Calling `start` again before
    /// [`Self::wait`] returned is ignored.
    pub fn start(
        &mut self,
        cancel: &CancellationToken,
        tasks: Vec<Task>,
        statuses: Arc<TaskStatusCollection>,
    ) {
        if self.running.is_some() {
            warn!("executor already started, ignoring new tasks");
            return;
        }

        let task_count = tasks.len();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for task in tasks {
            statuses.register(&task);
            if queue_tx.send(Arc::new(task)).is_err() {
                break;
            }
        }
        drop(queue_tx);

        let cancel = cancel.child_token();
        let worker = Arc::new(Worker {
            options: self.options.clone(),
            creator: Arc::clone(&self.creator),
            statuses,
            cancel: cancel.clone(),
        });
        let queue = Arc::new(Mutex::new(queue_rx));
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();

        let worker_count = self.options.parallelism.max(1).min(task_count);
        info!(tasks = task_count, workers = worker_count, "starting execution");

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let worker = Arc::clone(&worker);
            let queue = Arc::clone(&queue);
            let outcome_tx = outcome_tx.clone();
            workers.spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(task) = next else {
                        break;
                    };
                    let outcome = worker.execute(task).await;
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }

        self.running = Some(Running {
            workers,
            outcomes,
            cancel,
        });
    }

    /// Wait for every started task to finish.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Internal`] if the engine itself failed,
    /// [`ExecutorError::Cancelled`] if `cancel` fired, and
    /// [`ExecutorError::TaskFailures`] if any task failed and errors are not
    /// skipped. Every variant carries the results of the successful tasks.
    pub async fn wait(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskResult>, ExecutorError> {
        let Some(mut running) = self.running.take() else {
            return Err(ExecutorError::NotStarted);
        };

        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut internal: Option<TaskFailure> = None;
        let mut caller_cancelled = false;

        loop {
            tokio::select! {
                outcome = running.outcomes.recv() => match outcome {
                    Some(TaskOutcome::Success(result)) => results.push(result),
                    Some(TaskOutcome::Failure(failure)) => {
                        if internal.is_none() && failure.error.kind.is_internal() {
                            internal = Some(failure);
                        } else {
                            failures.push(failure);
                        }
                    }
                    None => break,
                },
                () = cancel.cancelled(), if !caller_cancelled => {
                    info!("execution cancelled, stopping all tasks");
                    caller_cancelled = true;
                    running.cancel.cancel();
                }
            }
        }

        while let Some(joined) = running.workers.join_next().await {
            if let Err(join_error) = joined {
                error!(%join_error, "executor worker failed");
                return Err(ExecutorError::Worker {
                    message: join_error.to_string(),
                    results,
                });
            }
        }

        if let Some(failure) = internal {
            return Err(ExecutorError::Internal {
                error: failure.error,
                results,
            });
        }
        if caller_cancelled {
            return Err(ExecutorError::Cancelled { results });
        }
        if !failures.is_empty() {
            if self.options.skip_errors {
                warn!(
                    failed = failures.len(),
                    succeeded = results.len(),
                    "skipping failed tasks"
                );
            } else {
                return Err(ExecutorError::TaskFailures { failures, results });
            }
        }
        info!(succeeded = results.len(), "execution finished");
        Ok(results)
    }
}

impl Worker {
    async fn execute(&self, task: Arc<Task>) -> TaskOutcome {
        let name = task.display_name();
        if self.cancel.is_cancelled() {
            return self.fail(task, TaskErrorKind::Cancelled);
        }

        self.statuses.mark_running(task.id);
        info!(task = %name, steps = task.steps.len(), "task started");
        let started = Instant::now();

        let task_cancel = self.cancel.child_token();
        let mut timed_out = None;
        let outcome = {
            let run = self.run(&task, &task_cancel);
            tokio::pin!(run);

            match self.options.timeout {
                Some(bound) => {
                    let finished = tokio::select! {
                        outcome = &mut run => Some(outcome),
                        () = sleep(bound) => None,
                    };
                    match finished {
                        Some(outcome) => outcome,
                        None => {
                            debug!(task = %name, ?bound, "timeout reached, cancelling task");
                            timed_out = Some(bound);
                            task_cancel.cancel();
                            run.await
                        }
                    }
                }
                None => run.await,
            }
        };

        match outcome {
            Ok((diff, context)) => {
                let result = TaskResult {
                    task: Arc::clone(&task),
                    diff,
                    context,
                    duration: started.elapsed(),
                };
                let files_changed = result.changed_files().len();
                self.statuses.mark_completed(task.id, files_changed);
                info!(task = %name, files_changed, elapsed = ?result.duration, "task completed");
                TaskOutcome::Success(result)
            }
            Err(kind) => self.fail(task, classify(kind, timed_out, &self.cancel)),
        }
    }

    async fn run(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(String, StepContext), TaskErrorKind> {
        let mut workspace = self.creator.create(cancel, task).await?;
        let outcome = self.run_in(&mut workspace, task, cancel).await;
        workspace.close();
        outcome
    }

    async fn run_in(
        &self,
        workspace: &mut Workspace,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(String, StepContext), TaskErrorKind> {
        let total = task.steps.len();
        let observer = |number: usize, step: &Step| {
            self.statuses
                .set_current_step(task.id, format!("{number}/{total} {}", step.label()));
        };

        let context = StepRunner::new(workspace, cancel, &observer)
            .run_all(&task.steps, task.initial_context())
            .await?;
        let diff = workspace.diff(cancel).await?;
        Ok((diff, context))
    }

    fn fail(&self, task: Arc<Task>, kind: TaskErrorKind) -> TaskOutcome {
        let internal = kind.is_internal();
        let error = TaskError::new(&task, kind);
        warn!(%error, "task failed");
        self.statuses.mark_failed(task.id, error.to_string());

        if internal {
            error!(%error, "internal failure, cancelling all tasks");
            self.cancel.cancel();
        } else if self.options.fail_fast && !matches!(error.kind, TaskErrorKind::Cancelled) {
            info!("fail-fast enabled, cancelling remaining tasks");
            self.cancel.cancel();
        }
        TaskOutcome::Failure(TaskFailure { task, error })
    }
}

/// Translate cancellation of a task into the reason it was cancelled.
fn classify(
    kind: TaskErrorKind,
    timed_out: Option<Duration>,
    shared: &CancellationToken,
) -> TaskErrorKind {
    let cancelled = matches!(
        kind,
        TaskErrorKind::Cancelled
            | TaskErrorKind::Process(ProcessError::Cancelled { .. })
            | TaskErrorKind::Fetch(FetchError::Cancelled { .. })
    );
    match timed_out {
        Some(bound) if cancelled => TimeoutError { bound }.into(),
        None if cancelled && shared.is_cancelled() => TaskErrorKind::Cancelled,
        _ => kind,
    }
}
