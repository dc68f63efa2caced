//! Completion and validation of per-site preprocessing output.
//!
//! A site's preprocessing is consumable only when every slide in its manifest
//! has a feature artifact. Exit status alone never counts as completion.

mod manifest;

pub use manifest::{scan_raw_dir, Manifest, ManifestSource};

use crate::core::{ArtifactId, FeatureNamespace};
use crate::errors::{IncompleteOutput, SiteflowError};
use crate::registry::Site;
use crate::tables::{Table, FILENAME_COLUMN, SITE_COLUMN};
use crate::utils::write_atomic;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};
use walkdir::WalkDir;

/// File name of the missing-slides report.
pub const MISSING_REPORT_FILE: &str = "missing_slides.csv";

#[allow(clippy::expect_used)]
static LOG_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ERROR|Exception").expect("log error pattern is valid"));

/// A suspicious line in an extractor log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogError {
    /// Log file.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// The line, trimmed.
    pub text: String,
}

/// Result of validating one site.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Site code.
    pub site: String,
    /// Whether the manifest came from the slide table.
    pub from_slide_table: bool,
    /// Number of expected artifacts.
    pub expected: usize,
    /// Number of expected artifacts present.
    pub present: usize,
    /// Expected slides without an artifact.
    pub missing: Vec<String>,
    /// Artifacts present that no slide accounts for.
    pub unexpected: Vec<String>,
    /// Slides listed in the slide table but absent from the raw directory.
    pub missing_raw: Vec<String>,
    /// Error lines found in the site's logs.
    pub log_errors: Vec<LogError>,
}

impl ValidationReport {
    /// True when nothing expected is missing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Processing progress for the site.
    #[must_use]
    pub fn summary(&self) -> ProcessingSummary {
        ProcessingSummary {
            site: self.site.clone(),
            total: self.expected,
            processed: self.present,
        }
    }

    /// Converts an incomplete report into the error that gates the scheduler.
    pub fn into_result(self) -> Result<Self, IncompleteOutput> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(IncompleteOutput {
                site: self.site,
                expected: self.expected,
                missing: self.missing,
            })
        }
    }
}

/// Per-site processing progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    /// Site code.
    pub site: String,
    /// Expected slides.
    pub total: usize,
    /// Slides with features.
    pub processed: usize,
}

impl ProcessingSummary {
    /// Percentage processed; an empty manifest counts as 100%.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        }
    }
}

/// Validates a site's feature namespace against its manifest.
///
/// Returns the report whether or not the site is complete; use
/// [`ValidationReport::into_result`] to gate on completeness.
pub fn validate(site: &Site) -> Result<ValidationReport, SiteflowError> {
    let manifest = Manifest::for_site(site)?;
    let namespace = FeatureNamespace::new(site.code.as_str(), &site.features_dir, &site.extractor);
    let produced = namespace.artifacts()?;

    let missing: Vec<String> = manifest
        .expected
        .iter()
        .filter(|(id, _)| !produced.contains_key(*id))
        .map(|(id, _)| id.stem.clone())
        .collect();
    let unexpected: Vec<String> = produced
        .keys()
        .filter(|id| !manifest.expected.contains_key(*id))
        .map(ArtifactId::to_string)
        .collect();
    let missing_raw = match manifest.source {
        ManifestSource::SlideTable(_) => manifest.missing_raw(),
        ManifestSource::RawScan(_) => Vec::new(),
    };
    let log_errors = scan_logs(&site.cache_dir);

    let report = ValidationReport {
        site: site.code.to_string(),
        from_slide_table: matches!(manifest.source, ManifestSource::SlideTable(_)),
        expected: manifest.expected.len(),
        present: manifest.expected.len() - missing.len(),
        missing,
        unexpected,
        missing_raw,
        log_errors,
    };

    if report.is_complete() {
        info!(site = %site.code, slides = report.expected, "Site output complete");
    } else {
        warn!(
            site = %site.code,
            missing = report.missing.len(),
            expected = report.expected,
            "Site output incomplete"
        );
    }
    if !report.log_errors.is_empty() {
        warn!(site = %site.code, errors = report.log_errors.len(), "Errors found in site logs");
    }
    Ok(report)
}

/// Collects lines matching `ERROR` or `Exception` from `*.log` files under
/// `cache_dir`.
pub fn scan_logs(cache_dir: &Path) -> Vec<LogError> {
    if !cache_dir.is_dir() {
        return Vec::new();
    }

    let mut errors = Vec::new();
    let logs = WalkDir::new(cache_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && e.path().extension().is_some_and(|x| x == "log"));
    for entry in logs {
        let text = match std::fs::read(entry.path()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(file = %entry.path().display(), error = %e, "Cannot read log");
                continue;
            }
        };
        for (idx, line) in text.lines().enumerate() {
            if LOG_ERROR.is_match(line) {
                errors.push(LogError {
                    file: entry.path().to_path_buf(),
                    line: idx + 1,
                    text: line.trim().to_string(),
                });
            }
        }
    }
    errors
}

/// Writes `SITE,FILENAME` rows for every missing slide. Returns the row count.
pub fn write_missing_report(reports: &[ValidationReport], path: &Path) -> Result<usize, SiteflowError> {
    let mut table = Table::new([SITE_COLUMN, FILENAME_COLUMN]);
    for report in reports {
        for slide in &report.missing {
            table.push_row(vec![report.site.clone(), slide.clone()]);
        }
    }
    write_atomic(path, table.to_csv_string().as_bytes())?;
    info!(path = %path.display(), rows = table.len(), "Wrote missing-slides report");
    Ok(table.len())
}
