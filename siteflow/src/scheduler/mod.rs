//! Dependency scheduling of (target, stage) jobs.
//!
//! - [`StateTable`]: explicit per-pair state, persisted between runs
//! - [`Scheduler`]: the submission loop with bounded parallelism and retries
//! - [`StageExecutor`]: the seam between scheduling and execution

mod engine;
mod executor;
mod retry;
mod state;

#[cfg(test)]
mod integration_tests;

pub use engine::{BlockedStage, FailureRecord, RunSummary, Scheduler};
pub use executor::{JobRequest, PipelineExecutor, StageExecutor};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use state::{StageState, StateTable};
