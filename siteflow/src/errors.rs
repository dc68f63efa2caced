//! Error types for siteflow.
//!
//! The taxonomy follows how far a failure propagates:
//! - [`ConfigError`]: a submission precondition failed; fatal to that submission only.
//! - [`StageFailure`]: the external tool exited non-zero; retryable, isolated to its target.
//! - [`IncompleteOutput`]: the tool exited 0 but artifacts are missing; blocks that site.
//! - [`ConsolidationConflict`]: namespace misconfiguration; aborts consolidation.

use crate::core::{JobStatus, Stage, Target};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for siteflow operations.
#[derive(Debug, Error)]
pub enum SiteflowError {
    /// The site registry could not be built.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A configuration could not be built or materialized.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// An external tool exited unsuccessfully.
    #[error("{0}")]
    StageFailure(#[from] StageFailure),

    /// A stage exited cleanly but left expected artifacts missing.
    #[error("{0}")]
    IncompleteOutput(#[from] IncompleteOutput),

    /// Consolidation namespaces are misconfigured.
    #[error("{0}")]
    ConsolidationConflict(#[from] ConsolidationConflict),

    /// An illegal state-table transition was requested.
    #[error("{0}")]
    State(#[from] StateError),

    /// A metadata table is malformed.
    #[error("{0}")]
    Table(#[from] TableError),

    /// The stage graph contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A job was cancelled.
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SiteflowError {
    /// Returns true if re-submitting the same job may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StageFailure(_) | Self::IncompleteOutput(_) | Self::Cancelled(_) | Self::Io(_)
        )
    }

    /// Short type name used in failure records.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Registry(_) => "RegistryError",
            Self::Config(_) => "ConfigError",
            Self::StageFailure(_) => "StageFailure",
            Self::IncompleteOutput(_) => "IncompleteOutput",
            Self::ConsolidationConflict(_) => "ConsolidationConflict",
            Self::State(_) => "StateError",
            Self::Table(_) => "TableError",
            Self::CycleDetected(_) => "CycleDetected",
            Self::Cancelled(_) => "Cancelled",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "IoError",
        }
    }

    /// Diagnostic info (code, summary, fix hint) for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::Config(e) => e.error_info(),
            Self::StageFailure(e) => e.error_info(),
            Self::IncompleteOutput(e) => e.error_info(),
            Self::ConsolidationConflict(e) => e.error_info(),
            Self::CycleDetected(e) => e.error_info.clone(),
            other => ErrorInfo::new(
                format!("SITEFLOW-{}", other.error_type().to_ascii_uppercase()),
                other.to_string(),
            ),
        }
    }
}

impl From<serde_json::Error> for SiteflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Metadata about an error for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g. "SITEFLOW-CONFIG-MISSING_INPUT").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while building the site registry. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No sites were declared.
    #[error("Site registry is empty")]
    Empty,

    /// The same code was listed twice.
    #[error("Duplicate site code: {code}")]
    DuplicateSite {
        /// The duplicated code.
        code: String,
    },

    /// The code does not match `[a-z0-9][a-z0-9_]*`.
    #[error("Invalid site code: '{code}'")]
    InvalidCode {
        /// The rejected code.
        code: String,
    },

    /// The code is reserved for the consolidated namespace.
    #[error("Site code '{code}' is reserved for the consolidated namespace")]
    ReservedCode {
        /// The rejected code.
        code: String,
    },
}

/// Errors raised before a job is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The target names a site that is not registered.
    #[error("Unknown site: {site}")]
    UnknownSite {
        /// The requested site.
        site: String,
    },

    /// The stage name is not recognized.
    #[error("Unknown stage: {name}")]
    UnknownStage {
        /// The requested stage name.
        name: String,
    },

    /// The stage cannot run over the given target.
    #[error("Stage '{stage}' cannot run for target '{target}'")]
    ScopeMismatch {
        /// The target.
        target: String,
        /// The stage.
        stage: Stage,
    },

    /// A required upstream artifact does not exist.
    #[error("Missing {what} for {target}/{stage}: {}", path.display())]
    MissingInput {
        /// The target.
        target: String,
        /// The stage being materialized.
        stage: Stage,
        /// Description of the missing input.
        what: String,
        /// The path that was expected.
        path: PathBuf,
    },

    /// The settings file is unreadable or malformed.
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl ConfigError {
    /// Diagnostic info for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        match self {
            Self::UnknownSite { site } => ErrorInfo::new("SITEFLOW-CONFIG-UNKNOWN_SITE", self.to_string())
                .with_fix_hint("List the site in the [[sites]] table of the settings file.")
                .with_context_entry("site", site.clone()),
            Self::UnknownStage { name } => ErrorInfo::new("SITEFLOW-CONFIG-UNKNOWN_STAGE", self.to_string())
                .with_context_entry("stage", name.clone()),
            Self::ScopeMismatch { target, stage } => {
                ErrorInfo::new("SITEFLOW-CONFIG-SCOPE", self.to_string())
                    .with_fix_hint("Run aggregate stages for target 'all' and site stages for a site code.")
                    .with_context_entry("target", target.clone())
                    .with_context_entry("stage", stage.to_string())
            }
            Self::MissingInput { target, stage, path, .. } => {
                ErrorInfo::new("SITEFLOW-CONFIG-MISSING_INPUT", self.to_string())
                    .with_fix_hint("Complete the upstream stage or provide the file, then resubmit.")
                    .with_context_entry("target", target.clone())
                    .with_context_entry("stage", stage.to_string())
                    .with_context_entry("path", path.display().to_string())
            }
            Self::InvalidSettings(_) => ErrorInfo::new("SITEFLOW-CONFIG-SETTINGS", self.to_string()),
        }
    }
}

/// An external tool exited unsuccessfully.
///
/// `stderr` carries the tool's own output verbatim; the orchestrator does
/// not interpret domain-specific causes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' failed for {target} (exit {}): {stderr}", exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
pub struct StageFailure {
    /// The target.
    pub target: Target,
    /// The stage.
    pub stage: Stage,
    /// Exit code, or `None` when terminated by a signal, timeout or cancellation.
    pub exit_code: Option<i32>,
    /// Captured standard error.
    pub stderr: String,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
}

impl StageFailure {
    /// Creates a stage failure stamped with the current time.
    #[must_use]
    pub fn new(target: Target, stage: Stage, exit_code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self {
            target,
            stage,
            exit_code,
            stderr: stderr.into(),
            at: Utc::now(),
        }
    }

    /// Diagnostic info for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new("SITEFLOW-STAGE-FAILED", self.to_string())
            .with_fix_hint(format!(
                "Inspect the tool log, then run `siteflow retry {} {}`.",
                self.target, self.stage
            ))
            .with_context_entry("target", self.target.to_string())
            .with_context_entry("stage", self.stage.to_string())
            .with_context_entry("at", self.at.to_rfc3339())
    }
}

/// A stage finished without producing every expected artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Incomplete output for {site}: {} of {expected} artifacts missing", missing.len())]
pub struct IncompleteOutput {
    /// The site.
    pub site: String,
    /// Number of expected artifacts.
    pub expected: usize,
    /// Missing artifact identities.
    pub missing: Vec<String>,
}

impl IncompleteOutput {
    /// Diagnostic info for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new("SITEFLOW-OUTPUT-INCOMPLETE", self.to_string())
            .with_fix_hint("Re-run preprocessing for the site; already extracted slides are kept.")
            .with_context_entry("site", self.site.clone())
    }
}

/// Consolidation target/source namespaces are misconfigured.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Consolidation conflict for {}: {message}", target.display())]
pub struct ConsolidationConflict {
    /// The target directory.
    pub target: PathBuf,
    /// What is wrong.
    pub message: String,
}

impl ConsolidationConflict {
    /// Creates a conflict error.
    #[must_use]
    pub fn new(target: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Diagnostic info for the error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new("SITEFLOW-CONSOLIDATE-CONFLICT", self.to_string())
            .with_fix_hint("The consolidated namespace must never be listed as a source.")
    }
}

/// An illegal state-table transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal transition for {target}/{stage}: {from} -> {to}")]
pub struct StateError {
    /// The target.
    pub target: Target,
    /// The stage.
    pub stage: Stage,
    /// Current status.
    pub from: JobStatus,
    /// Requested status.
    pub to: JobStatus,
}

/// A malformed metadata table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Table error in {} line {line}: {message}", path.display())]
pub struct TableError {
    /// The table file.
    pub path: PathBuf,
    /// 1-based line number (0 when not line-specific).
    pub line: usize,
    /// What is wrong.
    pub message: String,
}

impl TableError {
    /// Creates a table error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "SITEFLOW-GRAPH-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the prerequisites in the cycle.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}
