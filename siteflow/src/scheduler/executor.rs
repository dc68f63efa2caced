//! Executing one submitted (target, stage) job.

use crate::cancellation::CancellationToken;
use crate::config::ConfigGenerator;
use crate::consolidate::{merge_site_tables, Consolidator};
use crate::core::{FeatureNamespace, Job, JobOutcome, Stage, Target};
use crate::errors::{ConfigError, SiteflowError, StageFailure};
use crate::registry::{Site, SiteCode, AGGREGATE_CODE};
use crate::runner::StageRunner;
use crate::tracker;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// One job handed to an executor.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Site or aggregate.
    pub target: Target,
    /// Stage to run.
    pub stage: Stage,
    /// Attempt number.
    pub attempt: u32,
    /// Sites in the barrier, registry order.
    pub participants: Arc<[SiteCode]>,
}

/// Runs a job to completion. Implementations never touch the state table.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes the job and reports how it ended.
    async fn execute(&self, request: JobRequest, cancel: Arc<CancellationToken>) -> JobOutcome;
}

/// The production executor.
///
/// Tool-backed stages are materialized, written and handed to the
/// [`StageRunner`]. `validate` runs the completion tracker and `consolidate`
/// runs the consolidator, both in-process.
#[derive(Debug)]
pub struct PipelineExecutor {
    generator: Arc<ConfigGenerator>,
    runner: StageRunner,
    consolidator: Consolidator,
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(generator: Arc<ConfigGenerator>, runner: StageRunner) -> Self {
        Self {
            generator,
            runner,
            consolidator: Consolidator::new(),
        }
    }

    fn site(&self, target: &Target, stage: Stage) -> Result<Site, ConfigError> {
        let code = target.site().ok_or_else(|| ConfigError::ScopeMismatch {
            target: target.to_string(),
            stage,
        })?;
        self.generator
            .registry()
            .get(code.as_str())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSite {
                site: code.to_string(),
            })
    }

    async fn run_tool(&self, request: &JobRequest, cancel: Arc<CancellationToken>) -> JobOutcome {
        let job = Job::start(request.target.clone(), request.stage, request.attempt);
        let config = match self.generator.materialize(&request.target, request.stage) {
            Ok(config) => config,
            Err(e) => return JobOutcome::failed(job, None, e.into()),
        };
        let document = match self.generator.write(&config) {
            Ok(path) => path,
            Err(e) => return JobOutcome::failed(job, None, e),
        };
        self.runner.run(&config, &document, request.attempt, cancel).await
    }

    async fn validate(&self, request: &JobRequest) -> JobOutcome {
        let job = Job::start(request.target.clone(), request.stage, request.attempt);
        if let Err(e) = self.generator.materialize(&request.target, request.stage) {
            return JobOutcome::failed(job, None, e.into());
        }
        let site = match self.site(&request.target, request.stage) {
            Ok(site) => site,
            Err(e) => return JobOutcome::failed(job, None, e.into()),
        };

        let report = match tokio::task::spawn_blocking(move || tracker::validate(&site)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return JobOutcome::failed(job, None, e),
            Err(e) => {
                return JobOutcome::failed(job, None, SiteflowError::Internal(format!("validate task failed: {e}")))
            }
        };
        match report.into_result() {
            Ok(_) => JobOutcome::completed(job.complete(None)),
            Err(incomplete) => JobOutcome::failed(job, None, incomplete.into()),
        }
    }

    async fn consolidate(&self, request: &JobRequest) -> JobOutcome {
        let job = Job::start(request.target.clone(), request.stage, request.attempt);
        let layout = self.generator.layout();
        let registry = self.generator.registry();

        let sites: Vec<&Site> = request
            .participants
            .iter()
            .filter_map(|code| registry.get(code.as_str()))
            .collect();
        let target = FeatureNamespace::new(
            AGGREGATE_CODE,
            layout.aggregate_features_dir(),
            &self.generator.template().extractor,
        );
        let sources: Vec<FeatureNamespace> = sites
            .iter()
            .map(|s| FeatureNamespace::new(s.code.as_str(), &s.features_dir, &s.extractor))
            .collect();

        let report = match self.consolidator.consolidate(&target, &sources).await {
            Ok(report) => report,
            Err(conflict) => return JobOutcome::failed(job, None, conflict.into()),
        };
        if !report.is_clean() {
            let detail: Vec<String> = report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.source, f.error))
                .collect();
            let failure = StageFailure::new(Target::Aggregate, Stage::Consolidate, None, detail.join("\n"));
            return JobOutcome::failed(job, None, failure.into());
        }
        if !report.collisions.is_empty() {
            warn!(collisions = report.collisions.len(), "Consolidated namespace holds differing artifacts");
        }

        let clinical_out = layout.clinical_table(AGGREGATE_CODE);
        let slide_out = layout.slide_table(AGGREGATE_CODE);
        let owned: Vec<Site> = sites.into_iter().cloned().collect();
        let merged = tokio::task::spawn_blocking(move || {
            let sites: Vec<&Site> = owned.iter().collect();
            merge_site_tables(&sites, &clinical_out, &slide_out)
        });
        match merged.await {
            Ok(Ok(tables)) => {
                info!(
                    merged = report.merged,
                    clinical_rows = tables.clinical_rows,
                    slide_rows = tables.slide_rows,
                    "Consolidation stage finished"
                );
                JobOutcome::completed(job.complete(None))
            }
            Ok(Err(e)) => JobOutcome::failed(job, None, e),
            Err(e) => JobOutcome::failed(job, None, SiteflowError::Internal(format!("table merge task failed: {e}"))),
        }
    }
}

#[async_trait]
impl StageExecutor for PipelineExecutor {
    async fn execute(&self, request: JobRequest, cancel: Arc<CancellationToken>) -> JobOutcome {
        match request.stage {
            Stage::Validate => self.validate(&request).await,
            Stage::Consolidate => self.consolidate(&request).await,
            _ => self.run_tool(&request, cancel).await,
        }
    }
}
