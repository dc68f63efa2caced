//! Clinical and slide metadata tables.
//!
//! Tables are small CSV files with a header row. The clinical table has one
//! row per patient (`PATIENT` plus the label column); the slide table has one
//! row per slide (`PATIENT`, `FILENAME`, optionally `SITE`).

mod csv;
mod ops;

pub use ops::{clean_tables, merge, remap_labels, split_by_site, CleanReport, CleanedTables, SiteTables};

use crate::errors::TableError;
use std::path::{Path, PathBuf};

/// Patient identifier column.
pub const PATIENT_COLUMN: &str = "PATIENT";
/// Slide file column.
pub const FILENAME_COLUMN: &str = "FILENAME";
/// Originating site column.
pub const SITE_COLUMN: &str = "SITE";
/// Default ground-truth label column.
pub const DEFAULT_LABEL: &str = "isMSIH";

/// Returns true for values the tables treat as missing.
#[must_use]
pub fn is_missing(value: &str) -> bool {
    matches!(
        value.trim(),
        "" | "NA" | "N/A" | "NaN" | "nan" | "null" | "None" | "<NA>"
    )
}

/// An in-memory CSV table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    origin: Option<PathBuf>,
}

impl Table {
    /// Creates an empty table with the given columns.
    #[must_use]
    pub fn new<S: Into<String>>(headers: impl IntoIterator<Item = S>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            origin: None,
        }
    }

    /// Parses CSV text. `origin` is only used in error messages.
    ///
    /// Short rows are padded with empty values; long rows are an error.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, TableError> {
        let mut records = csv::parse_records(text, origin)?.into_iter();
        let Some((_, headers)) = records.next() else {
            return Err(TableError::new(origin, 0, "missing header row"));
        };
        let headers: Vec<String> = headers.into_iter().map(|h| h.trim().to_string()).collect();

        let mut rows = Vec::new();
        for (line, mut row) in records {
            if row.len() > headers.len() {
                return Err(TableError::new(
                    origin,
                    line,
                    format!("expected {} fields, found {}", headers.len(), row.len()),
                ));
            }
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self {
            headers,
            rows,
            origin: Some(origin.to_path_buf()),
        })
    }

    /// Reads a table from disk.
    pub fn read(path: &Path) -> Result<Self, TableError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| TableError::new(path, 0, format!("cannot read table: {e}")))?;
        Self::parse(&text, path)
    }

    /// Renders the table as CSV text.
    #[must_use]
    pub fn to_csv_string(&self) -> String {
        let mut out = csv::render_record(&self.headers);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&csv::render_record(row));
            out.push('\n');
        }
        out
    }

    /// Writes the table to disk, creating parent directories.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        crate::utils::write_atomic(path, self.to_csv_string().as_bytes())
    }

    /// Column names in order.
    #[must_use]
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Where the table was read from, if it came from disk.
    #[must_use]
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Position of a column that must exist.
    pub fn require_column(&self, name: &str) -> Result<usize, TableError> {
        self.column_index(name).ok_or_else(|| {
            TableError::new(
                self.origin.clone().unwrap_or_default(),
                1,
                format!("missing required column '{name}'"),
            )
        })
    }

    /// Appends a row, padding or truncating it to the header width.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    /// Values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Result<Vec<&str>, TableError> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// Returns a copy keeping only rows for which `keep` is true.
    #[must_use]
    pub fn filtered(&self, mut keep: impl FnMut(&[String]) -> bool) -> Self {
        Self {
            headers: self.headers.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
            origin: self.origin.clone(),
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Vec<String>> {
        &mut self.rows
    }
}
