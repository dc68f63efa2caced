//! Merging per-site metadata tables into the aggregate tables.

use crate::errors::SiteflowError;
use crate::registry::Site;
use crate::tables::{merge, Table};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// Row counts written by [`merge_site_tables`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableMergeReport {
    /// Rows in the aggregate clinical table.
    pub clinical_rows: usize,
    /// Rows in the aggregate slide table.
    pub slide_rows: usize,
    /// Sites that had no table of a kind.
    pub skipped: Vec<String>,
}

/// Concatenates each site's clinical and slide tables into the aggregate
/// tables, dropping duplicate rows.
///
/// A site without a table is skipped. A malformed table fails the merge.
pub fn merge_site_tables(
    sites: &[&Site],
    clinical_out: &Path,
    slide_out: &Path,
) -> Result<TableMergeReport, SiteflowError> {
    let mut clinical = Vec::new();
    let mut slides = Vec::new();
    let mut report = TableMergeReport::default();

    for site in sites {
        for (path, into) in [(&site.clinical_table, &mut clinical), (&site.slide_table, &mut slides)] {
            if path.is_file() {
                into.push(Table::read(path)?);
            } else {
                warn!(site = %site.code, path = %path.display(), "Site table missing, skipped");
                report.skipped.push(site.code.to_string());
            }
        }
    }
    report.skipped.dedup();

    if !clinical.is_empty() {
        let merged = merge(&clinical);
        merged.write(clinical_out)?;
        report.clinical_rows = merged.len();
    }
    if !slides.is_empty() {
        let merged = merge(&slides);
        merged.write(slide_out)?;
        report.slide_rows = merged.len();
    }

    info!(
        clinical_rows = report.clinical_rows,
        slide_rows = report.slide_rows,
        "Merged site tables"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StorageLayout;
    use crate::registry::{SiteRegistry, SiteSpec};

    #[test]
    fn test_merge_site_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path(), 2);
        let registry = SiteRegistry::new(
            &[SiteSpec::new("a"), SiteSpec::new("b"), SiteSpec::new("c")],
            &layout,
            "ctp",
            "cpu",
        )
        .unwrap();
        std::fs::create_dir_all(layout.tables_dir()).unwrap();
        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();
        std::fs::write(&a.clinical_table, "PATIENT,isMSIH\np1,MSIH\n").unwrap();
        std::fs::write(&a.slide_table, "PATIENT,FILENAME\np1,s1\n").unwrap();
        std::fs::write(&b.clinical_table, "PATIENT,isMSIH\np2,nonMSIH\np1,MSIH\n").unwrap();
        std::fs::write(&b.slide_table, "PATIENT,FILENAME\np2,s2\n").unwrap();

        let sites: Vec<&Site> = registry.sites().iter().collect();
        let clinical_out = layout.clinical_table("all");
        let slide_out = layout.slide_table("all");
        let report = merge_site_tables(&sites, &clinical_out, &slide_out).unwrap();

        assert_eq!(report.clinical_rows, 2);
        assert_eq!(report.slide_rows, 2);
        assert_eq!(report.skipped, vec!["c"]);
        assert_eq!(
            std::fs::read_to_string(clinical_out).unwrap(),
            "PATIENT,isMSIH\np1,MSIH\np2,nonMSIH\n"
        );
    }

    #[test]
    fn test_malformed_table_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path(), 2);
        let registry = SiteRegistry::new(&[SiteSpec::new("a")], &layout, "ctp", "cpu").unwrap();
        std::fs::create_dir_all(layout.tables_dir()).unwrap();
        std::fs::write(&registry.sites()[0].clinical_table, "PATIENT\np1,extra\n").unwrap();

        let sites: Vec<&Site> = registry.sites().iter().collect();
        let err = merge_site_tables(&sites, &tmp.path().join("c.csv"), &tmp.path().join("s.csv"));
        assert!(matches!(err, Err(SiteflowError::Table(_))));
    }
}
