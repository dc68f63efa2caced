//! Artifact identity and feature namespaces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Extension of extracted feature files.
pub const FEATURE_EXTENSION: &str = "h5";

/// Whole-slide image extensions recognized in raw directories.
pub const SLIDE_EXTENSIONS: &[&str] = &[
    "svs", "tif", "tiff", "ndpi", "mrxs", "scn", "vms", "vmu", "bif", "czi",
];

/// Stable identity of a feature artifact.
///
/// Derived from the source slide's file stem plus the extractor, so reruns
/// and merges land on the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId {
    /// Extractor identifier.
    pub extractor: String,
    /// Slide file stem.
    pub stem: String,
}

impl ArtifactId {
    /// Creates an artifact id.
    #[must_use]
    pub fn new(extractor: impl Into<String>, stem: impl Into<String>) -> Self {
        Self {
            extractor: extractor.into(),
            stem: stem.into(),
        }
    }

    /// Identity of the features expected for a slide file or table entry.
    ///
    /// Leading directories and a whole-slide extension are stripped, so
    /// `/x/y/ABC-1.svs` and `ABC-1` agree. Other dots are part of the stem.
    #[must_use]
    pub fn for_slide(extractor: &str, slide: &str) -> Self {
        let path = Path::new(slide.trim());
        let stem = if is_slide_file(path) {
            path.file_stem()
        } else {
            path.file_name()
        };
        let stem = stem.map_or_else(|| slide.trim().to_string(), |s| s.to_string_lossy().into_owned());
        Self::new(extractor, stem)
    }

    /// File name of the feature artifact.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{FEATURE_EXTENSION}", self.stem)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.extractor, self.stem)
    }
}

/// Returns true if the path has a whole-slide image extension.
#[must_use]
pub fn is_slide_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SLIDE_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(e)))
}

/// A directory of feature artifacts for one extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureNamespace {
    /// Namespace name (site code or `all`).
    pub name: String,
    /// The `features` directory.
    pub root: PathBuf,
    /// Extractor whose subdirectory holds the artifacts.
    pub extractor: String,
}

impl FeatureNamespace {
    /// Creates a namespace.
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, extractor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            extractor: extractor.into(),
        }
    }

    /// Directory holding this extractor's artifacts.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.extractor)
    }

    /// Path an artifact would occupy in this namespace.
    #[must_use]
    pub fn path_for(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(&id.extractor).join(id.file_name())
    }

    /// Lists the artifacts present.
    ///
    /// A missing directory is an empty namespace. Partial files left by an
    /// interrupted copy (dot-prefixed) are ignored.
    pub fn artifacts(&self) -> io::Result<BTreeMap<ArtifactId, PathBuf>> {
        let dir = self.dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut found = BTreeMap::new();
        for entry in entries {
            let path = entry?.path();
            let is_feature = path
                .extension()
                .is_some_and(|e| e == FEATURE_EXTENSION);
            let hidden = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_feature || hidden || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                let id = ArtifactId::new(self.extractor.clone(), stem.to_string_lossy());
                found.insert(id, path);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_id_for_slide_strips_path_and_extension() {
        let a = ArtifactId::for_slide("ctp", "/lab/raw/TCGA-AA-01.svs");
        let b = ArtifactId::for_slide("ctp", "TCGA-AA-01");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "ctp/TCGA-AA-01");
        assert_eq!(a.file_name(), "TCGA-AA-01.h5");

        let dotted = ArtifactId::for_slide("ctp", "TCGA-AA-01.A");
        assert_eq!(dotted.stem, "TCGA-AA-01.A");
    }

    #[test]
    fn test_is_slide_file() {
        assert!(is_slide_file(Path::new("a/b.svs")));
        assert!(is_slide_file(Path::new("b.NDPI")));
        assert!(!is_slide_file(Path::new("b.h5")));
        assert!(!is_slide_file(Path::new("README")));
    }

    #[test]
    fn test_namespace_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let ns = FeatureNamespace::new("msk", tmp.path(), "ctp");
        assert!(ns.artifacts().unwrap().is_empty());

        std::fs::create_dir_all(ns.dir()).unwrap();
        std::fs::write(ns.dir().join("s1.h5"), b"x").unwrap();
        std::fs::write(ns.dir().join("s2.h5"), b"y").unwrap();
        std::fs::write(ns.dir().join(".s3.h5.partial"), b"z").unwrap();
        std::fs::write(ns.dir().join("notes.txt"), b"n").unwrap();

        let found = ns.artifacts().unwrap();
        let stems: Vec<&str> = found.keys().map(|id| id.stem.as_str()).collect();
        assert_eq!(stems, vec!["s1", "s2"]);
        assert_eq!(ns.path_for(&ArtifactId::new("ctp", "s1")), ns.dir().join("s1.h5"));
    }
}
