//! Pipeline lifecycle events.

use super::{Job, Stage, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An event emitted while orchestrating a run.
///
/// Events are consumed by an [`EventSink`](crate::events::EventSink) for
/// logging or for assertions in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event type (e.g. "job.submitted", "barrier.blocked").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Creates an event with no payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: BTreeMap::new(),
        }
    }

    /// Adds a payload field.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    fn for_pair(event_type: &str, target: &Target, stage: Stage) -> Self {
        Self::new(event_type)
            .add_data("target", serde_json::json!(target.namespace()))
            .add_data("stage", serde_json::json!(stage.as_str()))
    }

    /// "job.submitted"
    #[must_use]
    pub fn job_submitted(target: &Target, stage: Stage, attempt: u32) -> Self {
        Self::for_pair("job.submitted", target, stage).add_data("attempt", serde_json::json!(attempt))
    }

    /// "job.completed"
    #[must_use]
    pub fn job_completed(job: &Job) -> Self {
        Self::for_pair("job.completed", &job.target, job.stage)
            .add_data("attempt", serde_json::json!(job.attempt))
            .add_data("duration_ms", serde_json::json!(job.duration_ms()))
    }

    /// "job.failed"
    #[must_use]
    pub fn job_failed(job: &Job) -> Self {
        Self::for_pair("job.failed", &job.target, job.stage)
            .add_data("attempt", serde_json::json!(job.attempt))
            .add_data("exit_code", serde_json::json!(job.exit_code))
            .add_data("error", serde_json::json!(job.error))
    }

    /// "job.rejected": the submission precondition failed.
    #[must_use]
    pub fn job_rejected(target: &Target, stage: Stage, error: &str) -> Self {
        Self::for_pair("job.rejected", target, stage).add_data("error", serde_json::json!(error))
    }

    /// "barrier.blocked"
    #[must_use]
    pub fn barrier_blocked(waiting_on: &[String]) -> Self {
        Self::new("barrier.blocked").add_data("waiting_on", serde_json::json!(waiting_on))
    }

    /// "barrier.released"
    #[must_use]
    pub fn barrier_released(sites: usize) -> Self {
        Self::new("barrier.released").add_data("sites", serde_json::json!(sites))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::new("test.event");
        assert_eq!(event.event_type, "test.event");
        assert!(event.data.is_empty());
        assert!(event.timestamp.contains('T'));
    }

    #[test]
    fn test_job_submitted_payload() {
        let target: Target = "msk".parse().unwrap();
        let event = PipelineEvent::job_submitted(&target, Stage::Preprocess, 2);
        assert_eq!(event.data.get("target"), Some(&serde_json::json!("msk")));
        assert_eq!(event.data.get("stage"), Some(&serde_json::json!("preprocess")));
        assert_eq!(event.data.get("attempt"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_job_failed_payload() {
        let job = Job::start(Target::Aggregate, Stage::Train, 1).fail(Some(1), "boom");
        let event = PipelineEvent::job_failed(&job);
        assert_eq!(event.event_type, "job.failed");
        assert_eq!(event.data.get("error"), Some(&serde_json::json!("boom")));
    }

    #[test]
    fn test_event_serialization_uses_type_key() {
        let json = serde_json::to_value(PipelineEvent::barrier_released(3)).unwrap();
        assert_eq!(json["type"], "barrier.released");
        assert_eq!(json["data"]["sites"], 3);
    }
}
