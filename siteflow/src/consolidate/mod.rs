//! Merging per-site feature artifacts into the shared namespace.
//!
//! Every copy lands in a hidden temp file and is published with a hard link,
//! which fails instead of overwriting. Two merges racing on one identity
//! therefore never interleave writes, and a rerun skips what is already there.

mod tables;

pub use tables::{merge_site_tables, TableMergeReport};

use crate::core::{ArtifactId, FeatureNamespace};
use crate::errors::ConsolidationConflict;
use crate::observability::SpanTimer;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static MERGE_LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

fn merge_lock(target: &Path) -> Arc<Mutex<()>> {
    MERGE_LOCKS
        .entry(target.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// An identity whose target copy differs from a source copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    /// Artifact identity.
    pub id: String,
    /// Source namespace that disagreed.
    pub source: String,
    /// SHA-256 of the target file.
    pub target_digest: String,
    /// SHA-256 of the source file.
    pub source_digest: String,
}

/// A source that could not be fully merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    /// Source namespace.
    pub source: String,
    /// What went wrong.
    pub error: String,
}

/// Outcome of one consolidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationReport {
    /// Artifacts copied in this run.
    pub merged: usize,
    /// Artifacts already present with identical content.
    pub already_present: usize,
    /// Copies merged per source.
    pub per_source: BTreeMap<String, usize>,
    /// Identities left untouched because contents differ.
    pub collisions: Vec<Collision>,
    /// Per-source failures; other sources are unaffected.
    pub failures: Vec<SourceFailure>,
}

impl ConsolidationReport {
    /// True when every source merged without failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct SourceStats {
    merged: usize,
    already_present: usize,
    collisions: Vec<Collision>,
    errors: Vec<String>,
}

/// Merges feature namespaces into a target namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct Consolidator;

impl Consolidator {
    /// Creates a consolidator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Copies every source artifact whose identity is absent from `target`.
    ///
    /// Merges into one target are serialized. Failing to read one source or
    /// to write one of its artifacts is recorded against that source only.
    ///
    /// # Errors
    ///
    /// Returns [`ConsolidationConflict`] when the target is also a source.
    pub async fn consolidate(
        &self,
        target: &FeatureNamespace,
        sources: &[FeatureNamespace],
    ) -> Result<ConsolidationReport, ConsolidationConflict> {
        let target_dir = target.dir();
        for source in sources {
            if source.name == target.name || same_dir(&source.dir(), &target_dir) {
                return Err(ConsolidationConflict::new(
                    &target_dir,
                    format!("namespace '{}' is both source and target", source.name),
                ));
            }
        }

        let lock = merge_lock(&target_dir);
        let _guard = lock.lock().await;
        let timer = SpanTimer::start(format!("consolidate:{}", target.name));

        let mut report = ConsolidationReport::default();
        for source in sources {
            let source = source.clone();
            let target = target.clone();
            let name = source.name.clone();
            let joined =
                tokio::task::spawn_blocking(move || merge_source(&source, &target)).await;

            let stats = match joined {
                Ok(Ok(stats)) => stats,
                Ok(Err(e)) => SourceStats {
                    errors: vec![e.to_string()],
                    ..SourceStats::default()
                },
                Err(e) => SourceStats {
                    errors: vec![format!("merge task failed: {e}")],
                    ..SourceStats::default()
                },
            };

            debug!(source = %name, merged = stats.merged, "Merged source namespace");
            report.merged += stats.merged;
            report.already_present += stats.already_present;
            report.per_source.insert(name.clone(), stats.merged);
            report.collisions.extend(stats.collisions);
            for error in stats.errors {
                warn!(source = %name, error = %error, "Consolidation failure");
                report.failures.push(SourceFailure {
                    source: name.clone(),
                    error,
                });
            }
        }

        info!(
            target = %target.name,
            merged = report.merged,
            already_present = report.already_present,
            collisions = report.collisions.len(),
            failures = report.failures.len(),
            duration_ms = timer.finish(),
            "Consolidation finished"
        );
        Ok(report)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn merge_source(source: &FeatureNamespace, target: &FeatureNamespace) -> io::Result<SourceStats> {
    let artifacts = source.artifacts()?;
    let mut stats = SourceStats::default();
    if artifacts.is_empty() {
        return Ok(stats);
    }
    std::fs::create_dir_all(target.dir())?;

    for (id, path) in artifacts {
        let dest = target.path_for(&id);
        match publish(&path, &dest) {
            Ok(true) => stats.merged += 1,
            Ok(false) => match compare(&id, source, &path, &dest) {
                Ok(None) => stats.already_present += 1,
                Ok(Some(collision)) => {
                    warn!(id = %collision.id, source = %collision.source, "Artifact collision");
                    stats.collisions.push(collision);
                }
                Err(e) => stats.errors.push(format!("{id}: {e}")),
            },
            Err(e) => stats.errors.push(format!("{id}: {e}")),
        }
    }
    Ok(stats)
}

/// Copies `src` to `dest` unless `dest` exists. Returns whether it copied.
fn publish(src: &Path, dest: &Path) -> io::Result<bool> {
    if dest.exists() {
        return Ok(false);
    }
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.partial", uuid::Uuid::new_v4().simple()));

    let result = std::fs::copy(src, &tmp).and_then(|_| std::fs::hard_link(&tmp, dest));
    let _ = std::fs::remove_file(&tmp);
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn compare(
    id: &ArtifactId,
    source: &FeatureNamespace,
    src: &Path,
    dest: &Path,
) -> io::Result<Option<Collision>> {
    let source_digest = file_digest(src)?;
    let target_digest = file_digest(dest)?;
    if source_digest == target_digest {
        Ok(None)
    } else {
        Ok(Some(Collision {
            id: id.to_string(),
            source: source.name.clone(),
            target_digest,
            source_digest,
        }))
    }
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
