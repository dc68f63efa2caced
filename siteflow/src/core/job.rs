//! One attempted execution of a stage for a target.

use super::{JobStatus, Stage, Target};
use crate::errors::SiteflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: Uuid,
    /// Site or aggregate.
    pub target: Target,
    /// Stage being executed.
    pub stage: Stage,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Current status.
    pub status: JobStatus,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Tool exit code, for tool-backed stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error text for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Creates a running job.
    #[must_use]
    pub fn start(target: Target, stage: Stage, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            stage,
            attempt,
            status: JobStatus::Running,
            started_at: Some(Utc::now()),
            ended_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Marks the job complete.
    #[must_use]
    pub fn complete(mut self, exit_code: Option<i32>) -> Self {
        self.status = JobStatus::Complete;
        self.exit_code = exit_code;
        self.ended_at = Some(Utc::now());
        self
    }

    /// Marks the job failed.
    #[must_use]
    pub fn fail(mut self, exit_code: Option<i32>, error: impl Into<String>) -> Self {
        self.status = JobStatus::Failed;
        self.exit_code = exit_code;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
        self
    }

    /// Wall-clock duration in milliseconds, once finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_microseconds().unwrap_or(i64::MAX) as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// A finished job together with the error that failed it, if any.
#[derive(Debug)]
pub struct JobOutcome {
    /// The job record (complete or failed).
    pub job: Job,
    /// Why the job failed.
    pub error: Option<SiteflowError>,
}

impl JobOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn completed(job: Job) -> Self {
        Self { job, error: None }
    }

    /// A failed outcome; the job is marked failed with the error text.
    #[must_use]
    pub fn failed(job: Job, exit_code: Option<i32>, error: SiteflowError) -> Self {
        let job = job.fail(exit_code, error.to_string());
        Self {
            job,
            error: Some(error),
        }
    }

    /// Returns true if the job completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.job.status == JobStatus::Complete
    }
}
