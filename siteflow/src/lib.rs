//! # Siteflow
//!
//! Orchestration for a multi-site histopathology pipeline.
//!
//! The same workflow (prepare, preprocess, validate) runs independently for
//! every participating site. The per-site features are then consolidated into
//! one shared dataset, which feeds cross-validation, training, statistics and
//! per-site heatmaps. Siteflow decides what to submit, in what order, and
//! whether a site's output is complete. The heavy lifting is done by an
//! external tool.
//!
//! - **Site registry**: a fixed, ordered list of sites
//! - **Config generation**: one pure function from template and site to a stage config
//! - **Stage runner**: invokes the external tool, with timeout and cancellation
//! - **Dependency scheduler**: a persisted state table, a join barrier before
//!   consolidation, bounded parallelism and retries
//! - **Consolidator**: collision-safe, idempotent merging of feature artifacts
//! - **Tracker**: manifest-diff validation of each site's output
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use siteflow::prelude::*;
//!
//! let settings = Settings::load(Path::new("siteflow.toml"))?;
//! let generator = Arc::new(settings.generator()?);
//! let runner = StageRunner::new(Arc::new(ExternalTool), settings.tool.clone());
//! let scheduler = Scheduler::new(Arc::new(PipelineExecutor::new(generator.clone(), runner)))
//!     .with_max_parallel(settings.scheduler.max_parallel)
//!     .with_retry(settings.scheduler.retry.clone());
//!
//! let mut state = StateTable::load(&settings.layout().state_file(), sites)?;
//! let summary = scheduler.run(&mut state, Arc::new(CancellationToken::new())).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cancellation;
pub mod config;
pub mod consolidate;
pub mod core;
pub mod errors;
pub mod events;
pub mod layout;
pub mod observability;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod settings;
pub mod tables;
pub mod tracker;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ConfigGenerator, ConfigTemplate, StageConfig};
    pub use crate::consolidate::{ConsolidationReport, Consolidator};
    pub use crate::core::{
        ArtifactId, FeatureNamespace, Job, JobOutcome, JobStatus, PipelineEvent, Stage,
        StageScope, Target,
    };
    pub use crate::errors::{
        ConfigError, ConsolidationConflict, IncompleteOutput, RegistryError, SiteflowError,
        StageFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::layout::StorageLayout;
    pub use crate::registry::{Site, SiteCode, SiteRegistry, SiteSpec};
    pub use crate::runner::{ExternalTool, StageRunner, ToolInvoker};
    pub use crate::scheduler::{
        PipelineExecutor, RetryConfig, RunSummary, Scheduler, StageExecutor, StateTable,
    };
    pub use crate::settings::Settings;
    pub use crate::tracker::{validate, ValidationReport};
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
