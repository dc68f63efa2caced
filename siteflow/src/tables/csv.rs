//! Minimal CSV reading and writing for metadata tables.
//!
//! Supports the subset the tables actually use: a header row, comma
//! separators, double-quoted fields with `""` escapes (quoted fields may
//! span lines), and LF or CRLF line endings.

use crate::errors::TableError;
use std::path::Path;

/// Splits CSV text into records, each tagged with its starting line number.
pub(crate) fn parse_records(text: &str, origin: &Path) -> Result<Vec<(usize, Vec<String>)>, TableError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record), record_line);
                line += 1;
                record_line = line;
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(TableError::new(origin, record_line, "unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record, record_line);
    }
    Ok(records)
}

fn push_record(records: &mut Vec<(usize, Vec<String>)>, record: Vec<String>, line: usize) {
    let blank = record.len() == 1 && record[0].trim().is_empty();
    if !blank {
        records.push((line, record));
    }
}

/// Quotes a field when it contains a separator, quote or line break.
pub(crate) fn escape_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Renders one record as a CSV line (without the trailing newline).
pub(crate) fn render_record<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}
