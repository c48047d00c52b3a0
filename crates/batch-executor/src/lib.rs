//! Parallel execution of batch change steps across repositories.
//!
//! The [`Executor`] runs every [`Task`](batch_core::Task) in its own
//! workspace with bounded concurrency, per-task timeouts and optional
//! fail-fast cancellation, producing one diff per task.

/// Worker pool, timeouts and result aggregation.
pub mod executor;
/// Tracing subscriber initialisation.
pub mod logging;
/// Per-task step state machine.
pub mod step_runner;

pub use executor::{Executor, ExecutorOptions};
pub use logging::init_tracing;
pub use step_runner::{StepObserver, StepRunner};
