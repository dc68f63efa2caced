//! The expected-artifact manifest for a site.

use crate::core::{is_slide_file, ArtifactId};
use crate::errors::SiteflowError;
use crate::registry::Site;
use crate::tables::{is_missing, Table, FILENAME_COLUMN};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Where the expected slide list came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// The site's slide table (`FILENAME` column).
    SlideTable(PathBuf),
    /// A scan of the raw slide directory.
    RawScan(PathBuf),
}

/// Expected artifacts for one site, keyed by identity, with the slide name
/// each came from.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Source of the slide list.
    pub source: ManifestSource,
    /// Expected identities and their slide names.
    pub expected: BTreeMap<ArtifactId, String>,
    /// Identities of slides actually present in the raw directory.
    pub raw_present: BTreeSet<ArtifactId>,
}

impl Manifest {
    /// Builds the manifest for a site.
    ///
    /// The slide table wins when it exists; otherwise every whole-slide file
    /// under the raw directory is expected once.
    pub fn for_site(site: &Site) -> Result<Self, SiteflowError> {
        let raw = scan_raw_dir(&site.raw_dir);
        let raw_present: BTreeSet<ArtifactId> = raw
            .iter()
            .map(|p| ArtifactId::for_slide(&site.extractor, &p.to_string_lossy()))
            .collect();

        if site.slide_table.is_file() {
            let table = Table::read(&site.slide_table)?;
            let mut expected = BTreeMap::new();
            for name in table.column_values(FILENAME_COLUMN)? {
                if is_missing(name) {
                    continue;
                }
                expected.insert(ArtifactId::for_slide(&site.extractor, name), name.to_string());
            }
            debug!(site = %site.code, slides = expected.len(), "Manifest from slide table");
            return Ok(Self {
                source: ManifestSource::SlideTable(site.slide_table.clone()),
                expected,
                raw_present,
            });
        }

        let expected = raw
            .iter()
            .map(|p| {
                let name = p.file_name().map_or_else(|| p.to_string_lossy(), |n| n.to_string_lossy());
                (ArtifactId::for_slide(&site.extractor, &name), name.into_owned())
            })
            .collect::<BTreeMap<_, _>>();
        debug!(site = %site.code, slides = expected.len(), "Manifest from raw scan");
        Ok(Self {
            source: ManifestSource::RawScan(site.raw_dir.clone()),
            expected,
            raw_present,
        })
    }

    /// Expected slides with no file in the raw directory.
    #[must_use]
    pub fn missing_raw(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|(id, _)| !self.raw_present.contains(*id))
            .map(|(_, name)| name.clone())
            .collect()
    }
}

/// Lists whole-slide files under `dir`, recursively, in path order.
///
/// A missing directory yields nothing. Unreadable entries are logged and
/// skipped.
pub fn scan_raw_dir(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }

    let mut slides = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_slide_file(entry.path()) => {
                slides.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!(dir = %dir.display(), error = %e, "Error accessing raw entry"),
        }
    }
    slides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use crate::registry::{SiteRegistry, SiteSpec};

    fn site(root: &Path) -> Site {
        let layout = StorageLayout::new(root, 2);
        let registry = SiteRegistry::new(&[SiteSpec::new("luth")], &layout, "ctp", "cpu").unwrap();
        registry.sites()[0].clone()
    }

    #[test]
    fn test_raw_scan_is_recursive_and_filters_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = tmp.path().join("raw");
        std::fs::create_dir_all(raw.join("batch2")).unwrap();
        std::fs::create_dir_all(raw.join(".trash")).unwrap();
        std::fs::write(raw.join("b.svs"), b"").unwrap();
        std::fs::write(raw.join("batch2/a.ndpi"), b"").unwrap();
        std::fs::write(raw.join("notes.txt"), b"").unwrap();
        std::fs::write(raw.join(".trash/c.svs"), b"").unwrap();

        let found = scan_raw_dir(&raw);
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.svs", "a.ndpi"]);
        assert!(scan_raw_dir(&tmp.path().join("nope")).is_empty());
    }

    #[test]
    fn test_manifest_prefers_slide_table() {
        let tmp = tempfile::tempdir().unwrap();
        let site = site(tmp.path());
        std::fs::create_dir_all(&site.raw_dir).unwrap();
        std::fs::write(site.raw_dir.join("S1.svs"), b"").unwrap();
        std::fs::write(site.raw_dir.join("S9.svs"), b"").unwrap();
        std::fs::create_dir_all(site.slide_table.parent().unwrap()).unwrap();
        std::fs::write(&site.slide_table, "PATIENT,FILENAME\np1,S1\np2,S2\np3,\n").unwrap();

        let manifest = Manifest::for_site(&site).unwrap();
        assert!(matches!(manifest.source, ManifestSource::SlideTable(_)));
        let stems: Vec<&str> = manifest.expected.keys().map(|id| id.stem.as_str()).collect();
        assert_eq!(stems, vec!["S1", "S2"]);
        assert_eq!(manifest.missing_raw(), vec!["S2"]);
    }

    #[test]
    fn test_manifest_falls_back_to_raw_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let site = site(tmp.path());
        std::fs::create_dir_all(&site.raw_dir).unwrap();
        std::fs::write(site.raw_dir.join("S1.svs"), b"").unwrap();

        let manifest = Manifest::for_site(&site).unwrap();
        assert!(matches!(manifest.source, ManifestSource::RawScan(_)));
        assert_eq!(manifest.expected.values().collect::<Vec<_>>(), vec!["S1.svs"]);
        assert!(manifest.missing_raw().is_empty());
    }
}
