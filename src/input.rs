//! Input handling — reads CSV/Excel files and detects address columns.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{format_err, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::Serialize;

use crate::models::Property;

// Column name variations we recognize for each address component.
const ADDRESS_CANDIDATES: &[&str] = &[
    "address",
    "street_address",
    "street",
    "addr",
    "property_address",
    "address_line",
    "address_line_1",
    "address1",
    "property address",
    "street address",
];
const CITY_CANDIDATES: &[&str] = &["city", "town", "municipality"];
const STATE_CANDIDATES: &[&str] = &["state", "st", "state_code", "province"];
const ZIP_CANDIDATES: &[&str] = &["zip", "zipcode", "zip_code", "postal_code", "postal"];

/// The original file as a plain table, all columns preserved verbatim.
#[derive(Clone, Debug)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FileFormat {
    Csv,
    Excel,
}

fn detect_format(path: &Path) -> Result<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "csv" => Ok(FileFormat::Csv),
        "xlsx" | "xls" => Ok(FileFormat::Excel),
        other => Err(format_err!(
            "unsupported file format {:?}; use .csv, .xlsx, or .xls",
            other
        )),
    }
}

/// Read the original file as a table, preserving all columns exactly.
pub fn read_table(path: &Path) -> Result<RawTable> {
    match detect_format(path)? {
        FileFormat::Csv => read_csv_table(path),
        FileFormat::Excel => read_excel_table(path),
    }
}

fn read_csv_table(path: &Path) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format_err!("cannot open {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .context("error reading CSV header")?
        .iter()
        .map(|h| h.to_owned())
        .collect();

    let mut rows = vec![];
    for record in reader.records() {
        let record = record.context("error reading CSV row")?;
        let mut row: Vec<String> = record.iter().map(|v| v.to_owned()).collect();
        // Short rows pad out so the column join stays aligned.
        row.resize(headers.len(), String::new());
        rows.push(row);
    }
    Ok(RawTable { headers, rows })
}

fn read_excel_table(path: &Path) -> Result<RawTable> {
    let mut workbook = open_workbook_auto(path)
        .with_context(|| format_err!("cannot open {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| format_err!("workbook has no sheets"))?
        .context("error reading worksheet")?;

    let mut iter = range.rows();
    let headers: Vec<String> = match iter.next() {
        Some(row) => row.iter().map(cell_to_string).collect(),
        None => return Ok(RawTable { headers: vec![], rows: vec![] }),
    };
    let rows: Vec<Vec<String>> = iter
        .map(|row| {
            let mut values: Vec<String> = row.iter().map(cell_to_string).collect();
            values.resize(headers.len(), String::new());
            values
        })
        .collect();
    Ok(RawTable { headers, rows })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        // Whole floats print as integers so ZIP codes don't grow ".0".
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

/// Find a matching column from a candidate list, case-insensitively.
fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    let lower: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim().to_lowercase(), i))
        .collect();
    candidates
        .iter()
        .find_map(|candidate| lower.get(*candidate).copied())
}

fn is_na(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "nan" | "none" | "<na>" | "na")
}

fn cell(row: &[String], idx: Option<usize>) -> String {
    let value = idx
        .and_then(|i| row.get(i))
        .map(|v| v.trim().to_owned())
        .unwrap_or_default();
    if is_na(&value) {
        String::new()
    } else {
        value
    }
}

/// Build a `Property` from one row, parsing components out of a combined
/// address string when the file doesn't carry separate columns.
fn property_from_row(
    row: &[String],
    row_index: usize,
    addr_col: usize,
    city_col: Option<usize>,
    state_col: Option<usize>,
    zip_col: Option<usize>,
) -> Property {
    let raw = cell(row, Some(addr_col));
    let mut city = cell(row, city_col);
    let mut state = cell(row, state_col);
    let mut zip_code = cell(row, zip_col);

    let mut address_line = raw.clone();
    if city.is_empty() && state.is_empty() {
        // "123 Main St, Springfield, IL 62704" and two-part variants.
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() >= 3 {
            address_line = parts[0].to_owned();
            city = parts[1].to_owned();
            let state_zip: Vec<&str> = parts[2].split_whitespace().collect();
            if let Some(first) = state_zip.first() {
                state = (*first).to_owned();
            }
            if state_zip.len() > 1 {
                zip_code = state_zip[1].to_owned();
            }
        } else if parts.len() == 2 {
            address_line = parts[0].to_owned();
            let state_zip: Vec<&str> = parts[1].split_whitespace().collect();
            if let Some(first) = state_zip.first() {
                if first.len() == 2 {
                    state = (*first).to_owned();
                } else {
                    city = (*first).to_owned();
                }
            }
            if state_zip.len() > 1 {
                let last = state_zip[state_zip.len() - 1];
                if last.len() == 5 && last.chars().all(|c| c.is_ascii_digit()) {
                    zip_code = last.to_owned();
                } else if last.len() == 2 {
                    state = last.to_owned();
                }
            }
        }
    }

    Property {
        raw_address: raw,
        address_line: address_line.to_uppercase().trim().to_owned(),
        city: city.to_uppercase().trim().to_owned(),
        state: state.to_uppercase().trim().to_owned(),
        zip_code: zip_code.trim().to_owned(),
        row_index,
    }
}

/// Read a CSV or Excel file into properties, auto-detecting the address
/// columns. Rows with no usable address are skipped (their row index is
/// skipped with them, so the output join stays aligned).
pub fn read_input(path: &Path) -> Result<Vec<Property>> {
    let table = read_table(path)?;
    if table.rows.is_empty() {
        return Err(format_err!("input file is empty"));
    }

    let addr_col = find_column(&table.headers, ADDRESS_CANDIDATES)
        // No recognizable address column: assume the first column.
        .unwrap_or(0);
    let city_col = find_column(&table.headers, CITY_CANDIDATES);
    let state_col = find_column(&table.headers, STATE_CANDIDATES);
    let zip_col = find_column(&table.headers, ZIP_CANDIDATES);

    let mut properties = vec![];
    for (idx, row) in table.rows.iter().enumerate() {
        let prop = property_from_row(row, idx, addr_col, city_col, state_col, zip_col);
        if !prop.raw_address.is_empty() {
            properties.push(prop);
        }
    }
    Ok(properties)
}

/// Validation summary for `--dry-run` and upload-time checks.
#[derive(Clone, Debug, Serialize)]
pub struct InputSummary {
    pub total_rows: usize,
    pub with_city: usize,
    pub with_state: usize,
    pub with_zip: usize,
    pub sample: Vec<String>,
}

pub fn validate_input(path: &Path) -> Result<InputSummary> {
    let properties = read_input(path)?;
    Ok(InputSummary {
        total_rows: properties.len(),
        with_city: properties.iter().filter(|p| !p.city.is_empty()).count(),
        with_state: properties.iter().filter(|p| !p.state.is_empty()).count(),
        with_zip: properties.iter().filter(|p| !p.zip_code.is_empty()).count(),
        sample: properties.iter().take(5).map(|p| p.search_query()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn detects_column_aliases() {
        let (_dir, path) = write_csv(
            "Property Address,Town,ST,Postal_Code\n\
             123 Main St,Springfield,IL,62704\n",
        );
        let props = read_input(&path).unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].address_line, "123 MAIN ST");
        assert_eq!(props[0].city, "SPRINGFIELD");
        assert_eq!(props[0].state, "IL");
        assert_eq!(props[0].zip_code, "62704");
    }

    #[test]
    fn splits_single_column_addresses() {
        let (_dir, path) = write_csv(
            "address\n\
             \"123 Main St, Springfield, IL 62704\"\n\
             \"456 Oak Ave, Boston MA\"\n",
        );
        let props = read_input(&path).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].city, "SPRINGFIELD");
        assert_eq!(props[0].state, "IL");
        assert_eq!(props[0].zip_code, "62704");
        assert_eq!(props[1].address_line, "456 OAK AVE");
        assert_eq!(props[1].city, "BOSTON");
        assert_eq!(props[1].state, "MA");
    }

    #[test]
    fn skips_blank_and_na_rows_but_keeps_indices() {
        let (_dir, path) = write_csv("address\n123 Main St\n\nnan\n456 Oak Ave\n");
        let props = read_input(&path).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].row_index, 0);
        assert_eq!(props[1].row_index, 3);
    }

    #[test]
    fn unknown_header_falls_back_to_first_column() {
        let (_dir, path) = write_csv("mystery,other\n123 Main St,foo\n");
        let props = read_input(&path).unwrap();
        assert_eq!(props[0].raw_address, "123 Main St");
    }

    #[test]
    fn empty_file_is_an_error() {
        let (_dir, path) = write_csv("address\n");
        assert!(read_input(&path).is_err());
    }

    #[test]
    fn rejects_unknown_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "address\n1 Main St\n").unwrap();
        assert!(read_input(&path).is_err());
    }

    #[test]
    fn validation_summary_counts_components() {
        let (_dir, path) = write_csv(
            "address,city,state,zip\n\
             123 Main St,Springfield,IL,62704\n\
             456 Oak Ave,,,\n",
        );
        let summary = validate_input(&path).unwrap();
        assert_eq!(summary.total_rows, 2);
        assert_eq!(summary.with_city, 1);
        assert_eq!(summary.with_state, 1);
        assert_eq!(summary.with_zip, 1);
        assert_eq!(summary.sample.len(), 2);
    }
}
