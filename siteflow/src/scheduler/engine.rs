//! The dependency scheduler loop.
//!
//! Submits every ready pair as soon as a job slot is free, then waits for the
//! first job to finish, a retry to come due or cancellation, and repeats until
//! nothing more can run.

use super::executor::{JobRequest, StageExecutor};
use super::retry::RetryConfig;
use super::state::StateTable;
use crate::cancellation::CancellationToken;
use crate::core::{Job, JobOutcome, JobStatus, PipelineEvent, Stage, Target};
use crate::errors::SiteflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::registry::SiteCode;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// A failed attempt, reported for individual re-submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    /// Site or aggregate.
    pub target: Target,
    /// Stage.
    pub stage: Stage,
    /// Attempt number.
    pub attempt: u32,
    /// When the attempt ended.
    pub at: DateTime<Utc>,
    /// Stable error code.
    pub code: String,
    /// Error text.
    pub error: String,
    /// Whether the scheduler will re-offer the pair on its own.
    pub will_retry: bool,
}

/// A pair that could not run, with what it is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedStage {
    /// Site or aggregate.
    pub target: Target,
    /// Stage.
    pub stage: Stage,
    /// Unmet prerequisites as `target/stage`.
    pub waiting_on: Vec<String>,
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Jobs that completed in this run.
    pub completed: Vec<Job>,
    /// Failed attempts in this run.
    pub failures: Vec<FailureRecord>,
    /// Pairs left failed after the run.
    pub unresolved: Vec<(Target, Stage)>,
    /// Pairs left pending after the run.
    pub blocked: Vec<BlockedStage>,
    /// Whether the run stopped on cancellation.
    pub cancelled: bool,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

impl RunSummary {
    /// True when every requested pair completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.unresolved.is_empty() && self.blocked.is_empty() && !self.cancelled
    }
}

/// Orders and submits stage jobs.
pub struct Scheduler {
    executor: Arc<dyn StageExecutor>,
    retry: RetryConfig,
    max_parallel: usize,
    event_sink: Arc<dyn EventSink>,
    state_file: Option<PathBuf>,
    until: Option<Stage>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("retry", &self.retry)
            .field("max_parallel", &self.max_parallel)
            .field("state_file", &self.state_file)
            .field("until", &self.until)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler with default retry policy and four job slots.
    #[must_use]
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            executor,
            retry: RetryConfig::default(),
            max_parallel: 4,
            event_sink: Arc::new(NoOpEventSink),
            state_file: None,
            until: None,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of concurrent job slots.
    #[must_use]
    pub fn with_max_parallel(mut self, slots: usize) -> Self {
        self.max_parallel = slots.max(1);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Persists the state table after every change.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Runs only `stage` and what it transitively requires.
    #[must_use]
    pub fn with_until(mut self, stage: Stage) -> Self {
        self.until = Some(stage);
        self
    }

    fn requested_stages(&self) -> BTreeSet<Stage> {
        let Some(until) = self.until else {
            return Stage::ALL.into_iter().collect();
        };
        let mut wanted = BTreeSet::new();
        let mut frontier = vec![until];
        while let Some(stage) = frontier.pop() {
            if wanted.insert(stage) {
                frontier.extend(stage.prerequisites().iter().map(|p| p.stage()));
            }
        }
        wanted
    }

    fn persist(&self, state: &StateTable) {
        if let Some(path) = &self.state_file {
            if let Err(e) = state.save(path) {
                error!(path = %path.display(), error = %e, "Failed to persist state");
            }
        }
    }

    /// Drives the state table until no further job can be submitted and none
    /// is running.
    ///
    /// Per-target failures never abort the run; they are recorded in the
    /// summary. Cancellation stops new submissions and lets running jobs end
    /// as failed.
    pub async fn run(
        &self,
        state: &mut StateTable,
        cancel: Arc<CancellationToken>,
    ) -> Result<RunSummary, SiteflowError> {
        let start = Instant::now();
        let wanted = self.requested_stages();
        let slots = Arc::new(Semaphore::new(self.max_parallel));
        let mut in_flight = FuturesUnordered::new();
        let mut summary = RunSummary::default();
        let mut barrier_waiting: Option<Vec<String>> = None;

        info!(
            sites = state.participants().len(),
            max_parallel = self.max_parallel,
            until = ?self.until,
            "Starting run"
        );

        loop {
            if !cancel.is_cancelled() {
                let now = Utc::now();
                for (target, stage) in state.release_due_retries(now) {
                    debug!(site = %target, stage = %stage, "Retry is due");
                }
                state.promote_ready();
                if wanted.contains(&Stage::Consolidate) {
                    self.report_barrier(state, &mut barrier_waiting).await;
                }

                let participants: Arc<[SiteCode]> = state.participants().into();
                for (target, stage) in state.ready_in_order() {
                    if !wanted.contains(&stage) {
                        continue;
                    }
                    let Ok(permit) = slots.clone().try_acquire_owned() else {
                        break;
                    };
                    let attempt = state.mark_running(&target, stage)?;
                    self.persist(state);
                    info!(site = %target, stage = %stage, attempt, "Submitting job");
                    self.event_sink
                        .emit(&PipelineEvent::job_submitted(&target, stage, attempt))
                        .await;

                    let request = JobRequest {
                        target: target.clone(),
                        stage,
                        attempt,
                        participants: participants.clone(),
                    };
                    let executor = self.executor.clone();
                    let token = cancel.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        executor.execute(request, token).await
                    });
                    in_flight.push(async move { (target, stage, attempt, handle.await) });
                }
            }

            let next_retry = if cancel.is_cancelled() {
                None
            } else {
                state.next_retry_in(Utc::now())
            };
            if in_flight.is_empty() {
                let Some(wait) = next_retry else {
                    break;
                };
                debug!(wait_ms = wait.as_millis() as u64, "Waiting for next retry");
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = cancel.cancelled() => {}
                }
                continue;
            }

            let (target, stage, attempt, joined) = tokio::select! {
                finished = in_flight.next() => match finished {
                    Some(finished) => finished,
                    None => continue,
                },
                () = tokio::time::sleep(next_retry.unwrap_or_default()), if next_retry.is_some() => continue,
                () = cancel.cancelled(), if !cancel.is_cancelled() => continue,
            };
            let outcome = joined.unwrap_or_else(|e| {
                JobOutcome::failed(
                    Job::start(target.clone(), stage, attempt),
                    None,
                    SiteflowError::Internal(format!("job task failed: {e}")),
                )
            });
            self.handle_outcome(state, outcome, &mut summary, &cancel).await?;
            self.persist(state);
        }

        summary.cancelled = cancel.is_cancelled();
        for (target, stage, entry) in state.iter() {
            if !wanted.contains(&stage) || target.site().is_some_and(|s| state.excluded().contains(s)) {
                continue;
            }
            match entry.status {
                JobStatus::Failed => summary.unresolved.push((target.clone(), stage)),
                JobStatus::Pending | JobStatus::Ready => summary.blocked.push(BlockedStage {
                    target: target.clone(),
                    stage,
                    waiting_on: state.unmet_prerequisites(target, stage),
                }),
                _ => {}
            }
        }
        summary.duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        info!(
            completed = summary.completed.len(),
            failed_attempts = summary.failures.len(),
            unresolved = summary.unresolved.len(),
            blocked = summary.blocked.len(),
            duration_ms = summary.duration_ms,
            "Run finished"
        );
        Ok(summary)
    }

    async fn handle_outcome(
        &self,
        state: &mut StateTable,
        outcome: JobOutcome,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<(), SiteflowError> {
        let JobOutcome { job, error } = outcome;
        state.record(&job)?;

        let Some(error) = error else {
            info!(
                site = %job.target,
                stage = %job.stage,
                attempt = job.attempt,
                duration_ms = job.duration_ms().unwrap_or_default(),
                "Job completed"
            );
            self.event_sink.emit(&PipelineEvent::job_completed(&job)).await;
            summary.completed.push(job);
            return Ok(());
        };

        if matches!(error, SiteflowError::Config(_)) {
            self.event_sink
                .emit(&PipelineEvent::job_rejected(&job.target, job.stage, &error.to_string()))
                .await;
        }
        self.event_sink.emit(&PipelineEvent::job_failed(&job)).await;

        let round = state.get(&job.target, job.stage).map_or(job.attempt, |s| s.round_attempts);
        let mut will_retry = false;

        if let (SiteflowError::IncompleteOutput(incomplete), Stage::Validate) = (&error, job.stage) {
            let preprocess_round = state
                .get(&job.target, Stage::Preprocess)
                .map_or(u32::MAX, |s| s.round_attempts);
            if !cancel.is_cancelled() && self.retry.allows_retry_after(preprocess_round) {
                warn!(
                    site = %job.target,
                    missing = incomplete.missing.len(),
                    "Output incomplete, reopening preprocess"
                );
                state.resubmit(&job.target, Stage::Preprocess)?;
                will_retry = true;
            }
        } else if error.is_retryable() && !cancel.is_cancelled() && self.retry.allows_retry_after(round) {
            let delay = self.retry.delay_after(round);
            let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            state.schedule_retry(&job.target, job.stage, at)?;
            will_retry = true;
        }

        warn!(
            site = %job.target,
            stage = %job.stage,
            attempt = job.attempt,
            will_retry,
            error = %error,
            "Job failed"
        );
        summary.failures.push(FailureRecord {
            target: job.target.clone(),
            stage: job.stage,
            attempt: job.attempt,
            at: job.ended_at.unwrap_or_else(Utc::now),
            code: error.error_info().code,
            error: error.to_string(),
            will_retry,
        });
        Ok(())
    }

    async fn report_barrier(&self, state: &StateTable, last: &mut Option<Vec<String>>) {
        if !matches!(
            state.status(&Target::Aggregate, Stage::Consolidate),
            JobStatus::Pending | JobStatus::Ready
        ) {
            return;
        }
        let waiting = state.barrier_waiting_on();
        if last.as_ref() == Some(&waiting) {
            return;
        }
        if waiting.is_empty() {
            let sites = state.participants().len();
            info!(sites, "Consolidation barrier released");
            self.event_sink.emit(&PipelineEvent::barrier_released(sites)).await;
        } else {
            debug!(waiting_on = ?waiting, "Consolidation barrier blocked");
            self.event_sink.emit(&PipelineEvent::barrier_blocked(&waiting)).await;
        }
        *last = Some(waiting);
    }
}
