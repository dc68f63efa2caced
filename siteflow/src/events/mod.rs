//! Event sinks for run lifecycle events.
//!
//! The scheduler reports every submission, completion, failure and barrier
//! decision as a [`PipelineEvent`](crate::core::PipelineEvent). Sinks decide
//! what to do with them: log, discard, or keep for inspection.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
