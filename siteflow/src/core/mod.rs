//! Core domain model types for siteflow.
//!
//! - Stages, their scope and prerequisite graph
//! - Job targets and job status
//! - Job records, artifacts and lifecycle events

mod artifact;
mod event;
mod job;
mod stage;
mod status;
mod target;

pub use artifact::{is_slide_file, ArtifactId, FeatureNamespace, FEATURE_EXTENSION, SLIDE_EXTENSIONS};
pub use event::PipelineEvent;
pub use job::{Job, JobOutcome};
pub use stage::{topological_order, Prerequisite, Stage, StageScope};
pub use status::JobStatus;
pub use target::Target;
