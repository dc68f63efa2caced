//! Job status for a (target, stage) pair.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The scheduling status of a (target, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on prerequisites.
    #[default]
    Pending,
    /// Prerequisites satisfied, eligible for submission.
    Ready,
    /// Submitted and not yet finished.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished unsuccessfully, cancelled, or interrupted.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Returns true if the status represents a finished job.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns true if the status is `Complete`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Returns true if the status is `Failed`.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Returns true if `self -> next` is a legal transition within an attempt.
    ///
    /// `Complete` is final for an attempt; starting over requires a new
    /// attempt through the state table's `reopen`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready)
                | (Self::Ready, Self::Pending)
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Failed, Self::Ready)
                | (Self::Failed, Self::Pending)
        )
    }
}
