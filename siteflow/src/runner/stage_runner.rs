//! Runs one tool-backed stage for one configuration.

use super::invoker::{Interruption, ToolInvocation, ToolInvoker};
use crate::cancellation::CancellationToken;
use crate::config::StageConfig;
use crate::core::{Job, JobOutcome};
use crate::errors::{SiteflowError, StageFailure};
use crate::settings::ToolSettings;
use crate::utils::{append_to_file, iso_timestamp};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Executes stages by invoking the external tool.
///
/// Success means exit status 0 and nothing more: output completeness is the
/// tracker's business.
pub struct StageRunner {
    invoker: Arc<dyn ToolInvoker>,
    tool: ToolSettings,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner").field("tool", &self.tool).finish()
    }
}

impl StageRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>, tool: ToolSettings) -> Self {
        Self { invoker, tool }
    }

    /// The command line for a stage, or `None` for in-process stages.
    ///
    /// Shape: `<program> [args..] --config <document> <command>`.
    #[must_use]
    pub fn invocation(&self, config: &StageConfig, document: &Path) -> Option<ToolInvocation> {
        let command = config.stage.tool_command()?;
        let mut args = self.tool.args.clone();
        args.push("--config".to_string());
        args.push(document.display().to_string());
        args.push(command.to_string());
        Some(ToolInvocation {
            program: self.tool.program.clone(),
            args,
            timeout: self.tool.timeout(),
        })
    }

    /// Runs the stage and waits for the tool to exit.
    ///
    /// Tool output is appended to the stage log. A non-zero exit, timeout or
    /// launch error yields a failed job carrying a [`StageFailure`] with the
    /// tool's stderr unmodified; cancellation yields `Cancelled`.
    pub async fn run(
        &self,
        config: &StageConfig,
        document: &Path,
        attempt: u32,
        cancel: Arc<CancellationToken>,
    ) -> JobOutcome {
        let job = Job::start(config.target.clone(), config.stage, attempt);

        let Some(invocation) = self.invocation(config, document) else {
            let err = SiteflowError::Internal(format!("stage '{}' has no tool command", config.stage));
            return JobOutcome::failed(job, None, err);
        };

        let log_path = config.log_path();
        let header = format!(
            "=== {} {}/{} attempt {}: {} ===\n",
            iso_timestamp(),
            config.target,
            config.stage,
            attempt,
            invocation.command_line()
        );
        self.append_log(&log_path, header.as_bytes()).await;

        info!(
            site = %config.target,
            stage = %config.stage,
            attempt,
            command = %invocation.command_line(),
            "Starting tool"
        );

        let output = match self.invoker.invoke(&invocation, cancel.clone()).await {
            Ok(output) => output,
            Err(e) => {
                let stderr = format!("failed to launch {}: {e}", invocation.program);
                self.append_log(&log_path, format!("{stderr}\n").as_bytes()).await;
                let failure = StageFailure::new(config.target.clone(), config.stage, None, stderr);
                return JobOutcome::failed(job, None, failure.into());
            }
        };

        self.append_log(&log_path, output.stdout.as_bytes()).await;
        self.append_log(&log_path, output.stderr.as_bytes()).await;

        match output.interruption {
            Some(Interruption::Cancelled) => {
                let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                JobOutcome::failed(job, None, SiteflowError::Cancelled(reason))
            }
            Some(Interruption::TimedOut(after)) => {
                let stderr = if output.stderr.is_empty() {
                    format!("timed out after {}s", after.as_secs())
                } else {
                    output.stderr
                };
                warn!(site = %config.target, stage = %config.stage, attempt, "Tool timed out");
                let failure = StageFailure::new(config.target.clone(), config.stage, None, stderr);
                JobOutcome::failed(job, None, failure.into())
            }
            None if output.exit_code == Some(0) => {
                let job = job.complete(Some(0));
                info!(
                    site = %config.target,
                    stage = %config.stage,
                    attempt,
                    duration_ms = job.duration_ms().unwrap_or_default(),
                    "Tool finished"
                );
                JobOutcome::completed(job)
            }
            None => {
                warn!(
                    site = %config.target,
                    stage = %config.stage,
                    attempt,
                    exit_code = ?output.exit_code,
                    "Tool failed"
                );
                let failure = StageFailure::new(
                    config.target.clone(),
                    config.stage,
                    output.exit_code,
                    output.stderr,
                );
                JobOutcome::failed(job, output.exit_code, failure.into())
            }
        }
    }

    async fn append_log(&self, path: &Path, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = append_to_file(path, bytes).await {
            warn!(path = %path.display(), error = %e, "Failed to append to stage log");
        }
    }
}
