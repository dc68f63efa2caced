//! Table cleaning, splitting, relabeling and merging.

use super::{is_missing, Table, PATIENT_COLUMN, SITE_COLUMN};
use crate::errors::TableError;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Row counts removed by [`clean_tables`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Patients dropped for an empty label.
    pub unlabeled_patients: usize,
    /// Slides dropped because their patient was dropped or unknown.
    pub orphan_slides: usize,
    /// Patients dropped for having no slides.
    pub patients_without_slides: usize,
    /// Remaining patients per label value.
    pub label_counts: BTreeMap<String, usize>,
}

/// Output of [`clean_tables`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedTables {
    /// Clinical table with only labeled patients that have slides.
    pub clinical: Table,
    /// Slide table with only slides of kept patients.
    pub slides: Table,
    /// What was removed.
    pub report: CleanReport,
}

/// Makes the clinical and slide tables agree.
///
/// Drops patients with a missing label, then slides whose patient is not in
/// the remaining clinical table, then patients left without any slide.
pub fn clean_tables(clinical: &Table, slides: &Table, label: &str) -> Result<CleanedTables, TableError> {
    let c_patient = clinical.require_column(PATIENT_COLUMN)?;
    let c_label = clinical.require_column(label)?;
    let s_patient = slides.require_column(PATIENT_COLUMN)?;

    let labeled = clinical.filtered(|r| !is_missing(&r[c_label]));
    let unlabeled_patients = clinical.len() - labeled.len();

    let valid: HashSet<&str> = labeled.rows().iter().map(|r| r[c_patient].as_str()).collect();
    let kept_slides = slides.filtered(|r| valid.contains(r[s_patient].as_str()));
    let orphan_slides = slides.len() - kept_slides.len();

    let with_slides: HashSet<&str> = kept_slides.rows().iter().map(|r| r[s_patient].as_str()).collect();
    let kept_clinical = labeled.filtered(|r| with_slides.contains(r[c_patient].as_str()));
    let patients_without_slides = labeled.len() - kept_clinical.len();

    let mut label_counts = BTreeMap::new();
    for row in kept_clinical.rows() {
        *label_counts.entry(row[c_label].clone()).or_insert(0) += 1;
    }

    tracing::info!(
        patients = kept_clinical.len(),
        slides = kept_slides.len(),
        unlabeled_patients,
        orphan_slides,
        patients_without_slides,
        "Cleaned tables"
    );

    Ok(CleanedTables {
        clinical: kept_clinical,
        slides: kept_slides,
        report: CleanReport {
            unlabeled_patients,
            orphan_slides,
            patients_without_slides,
            label_counts,
        },
    })
}

/// One site's share of the combined tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTables {
    /// Value of the `SITE` column.
    pub site: String,
    /// Patients with at least one slide at the site.
    pub clinical: Table,
    /// The site's slides.
    pub slides: Table,
}

/// Splits combined tables by the slide table's `SITE` column.
///
/// Sites come out in first-seen order. A patient with slides at two sites
/// appears in both clinical tables.
pub fn split_by_site(clinical: &Table, slides: &Table) -> Result<Vec<SiteTables>, TableError> {
    let s_site = slides.require_column(SITE_COLUMN)?;
    let s_patient = slides.require_column(PATIENT_COLUMN)?;
    let c_patient = clinical.require_column(PATIENT_COLUMN)?;

    let mut order: Vec<&str> = Vec::new();
    for row in slides.rows() {
        let site = row[s_site].as_str();
        if !is_missing(site) && !order.contains(&site) {
            order.push(site);
        }
    }

    Ok(order
        .into_iter()
        .map(|site| {
            let site_slides = slides.filtered(|r| r[s_site] == site);
            let patients: HashSet<&str> = site_slides.rows().iter().map(|r| r[s_patient].as_str()).collect();
            let site_clinical = clinical.filtered(|r| patients.contains(r[c_patient].as_str()));
            SiteTables {
                site: site.to_string(),
                clinical: site_clinical,
                slides: site_slides,
            }
        })
        .collect())
}

/// Replaces label values according to `mapping`, returning how many changed.
///
/// Values without a mapping entry are left as they are.
pub fn remap_labels(
    table: &mut Table,
    label: &str,
    mapping: &BTreeMap<String, String>,
) -> Result<usize, TableError> {
    let idx = table.require_column(label)?;
    let mut changed = 0;
    for row in table.rows_mut() {
        if let Some(new) = mapping.get(row[idx].as_str()) {
            if row[idx] != *new {
                row[idx].clone_from(new);
                changed += 1;
            }
        }
    }
    Ok(changed)
}

/// Concatenates tables, de-duplicating identical rows.
///
/// Columns are the union of all headers in first-seen order; rows keep
/// first-seen order.
#[must_use]
pub fn merge(tables: &[Table]) -> Table {
    let mut headers: Vec<String> = Vec::new();
    for table in tables {
        for h in table.headers() {
            if !headers.contains(h) {
                headers.push(h.clone());
            }
        }
    }

    let mut merged = Table::new(headers.clone());
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for table in tables {
        let positions: Vec<Option<usize>> = headers.iter().map(|h| table.column_index(h)).collect();
        for row in table.rows() {
            let aligned: Vec<String> = positions
                .iter()
                .map(|p| p.map(|i| row[i].clone()).unwrap_or_default())
                .collect();
            if seen.insert(aligned.clone()) {
                merged.push_row(aligned);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{DEFAULT_LABEL, FILENAME_COLUMN};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn table(text: &str) -> Table {
        Table::parse(text, Path::new("t.csv")).unwrap()
    }

    #[test]
    fn test_clean_tables() {
        let clinical = table("PATIENT,isMSIH\np1,MSS\np2,\np3,MSI-H\np4,MSS\n");
        let slides = table("PATIENT,FILENAME\np1,a.svs\np2,b.svs\np3,c.svs\np3,d.svs\np9,z.svs\n");

        let cleaned = clean_tables(&clinical, &slides, DEFAULT_LABEL).unwrap();

        assert_eq!(cleaned.clinical.column_values(PATIENT_COLUMN).unwrap(), vec!["p1", "p3"]);
        assert_eq!(
            cleaned.slides.column_values(FILENAME_COLUMN).unwrap(),
            vec!["a.svs", "c.svs", "d.svs"]
        );
        assert_eq!(cleaned.report.unlabeled_patients, 1);
        assert_eq!(cleaned.report.orphan_slides, 2);
        assert_eq!(cleaned.report.patients_without_slides, 1);
        assert_eq!(cleaned.report.label_counts.get("MSS"), Some(&1));
        assert_eq!(cleaned.report.label_counts.get("MSI-H"), Some(&1));
    }

    #[test]
    fn test_clean_requires_label_column() {
        let clinical = table("PATIENT\np1\n");
        let slides = table("PATIENT,FILENAME\np1,a\n");
        assert!(clean_tables(&clinical, &slides, DEFAULT_LABEL).is_err());
    }

    #[test]
    fn test_split_by_site_first_seen_order() {
        let clinical = table("PATIENT,isMSIH\np1,MSS\np2,MSI-H\np3,MSS\n");
        let slides = table("PATIENT,FILENAME,SITE\np2,b,luth\np1,a,msk\np3,c,luth\n");

        let split = split_by_site(&clinical, &slides).unwrap();
        let sites: Vec<&str> = split.iter().map(|s| s.site.as_str()).collect();
        assert_eq!(sites, vec!["luth", "msk"]);
        assert_eq!(split[0].slides.len(), 2);
        assert_eq!(split[0].clinical.column_values(PATIENT_COLUMN).unwrap(), vec!["p2", "p3"]);
        assert_eq!(split[1].clinical.column_values(PATIENT_COLUMN).unwrap(), vec!["p1"]);
    }

    #[test]
    fn test_split_requires_site_column() {
        let clinical = table("PATIENT,isMSIH\np1,MSS\n");
        let slides = table("PATIENT,FILENAME\np1,a\n");
        let err = split_by_site(&clinical, &slides).unwrap_err();
        assert!(err.message.contains("SITE"));
    }

    #[test]
    fn test_remap_labels() {
        let mut clinical = table("PATIENT,isMSIH\np1,MSS\np2,MSI-H\np3,unknown\n");
        let mapping: BTreeMap<String, String> = [("MSS", "nonMSIH"), ("MSI-H", "MSIH")]
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();

        let changed = remap_labels(&mut clinical, DEFAULT_LABEL, &mapping).unwrap();
        assert_eq!(changed, 2);
        assert_eq!(
            clinical.column_values(DEFAULT_LABEL).unwrap(),
            vec!["nonMSIH", "MSIH", "unknown"]
        );
    }

    #[test]
    fn test_merge_unions_columns_and_dedups() {
        let a = table("PATIENT,FILENAME\np1,a\np2,b\n");
        let b = table("PATIENT,FILENAME,SITE\np2,b,\np3,c,uith\n");
        let merged = merge(&[a.clone(), b, a]);

        assert_eq!(merged.headers(), &["PATIENT", "FILENAME", "SITE"]);
        assert_eq!(merged.column_values(PATIENT_COLUMN).unwrap(), vec!["p1", "p2", "p3"]);
    }
}
