//! Output handling — joins results back onto the original table and
//! exports them.
//!
//! The ZIP export preserves every original column verbatim, appends the
//! agent columns, and partitions rows by lookup status into three CSVs.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Result};
use serde::Serialize;
use serde_json::json;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::input::{read_table, RawTable};
use crate::models::{LookupStatus, ScrapeResult};

/// The agent-info columns appended to the original table, in order.
pub const AGENT_COLUMNS: &[&str] = &[
    "agent_name",
    "brokerage",
    "agent_phone",
    "agent_email",
    "data_source",
    "listing_url",
    "list_date",
    "days_on_market",
    "listing_price",
    "lookup_status",
    "confidence",
    "verified",
    "sources_matched",
];

fn agent_values(result: &ScrapeResult) -> Vec<String> {
    let info = result.agent_info.clone().unwrap_or_default();
    vec![
        info.agent_name,
        info.brokerage,
        info.phone,
        info.email,
        info.source,
        info.listing_url,
        info.list_date,
        info.days_on_market,
        info.listing_price,
        result.status.to_string(),
        format!("{:.2}", result.confidence),
        if result.verified { "Yes" } else { "No" }.to_owned(),
        result.sources_matched.join(", "),
    ]
}

fn scrub(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "nan" | "none" | "<na>" | "na" => String::new(),
        _ => value.to_owned(),
    }
}

/// Which of the three archive files a row belongs in.
fn partition_for(status: &str) -> usize {
    match status {
        "found" | "cached" => 0,
        "partial" => 1,
        // not_found, error, and rows that never produced a result.
        _ => 2,
    }
}

/// Export results as a ZIP of three CSVs (`found_agents.csv`,
/// `partial_agents.csv`, `not_found.csv`), each preserving all original
/// input columns with the agent columns appended.
pub fn export_results_zip(
    results: &[ScrapeResult],
    original_file: &Path,
    output_zip: &Path,
) -> Result<PathBuf> {
    let table = read_table(original_file)?;
    let by_row_index: HashMap<usize, &ScrapeResult> = results
        .iter()
        .map(|result| (result.property.row_index, result))
        .collect();

    let mut out_headers: Vec<String> = table.headers.clone();
    out_headers.extend(AGENT_COLUMNS.iter().map(|c| (*c).to_owned()));

    // One CSV writer per partition.
    let mut writers: Vec<csv::Writer<Vec<u8>>> = (0..3)
        .map(|_| csv::Writer::from_writer(vec![]))
        .collect();
    for writer in &mut writers {
        writer.write_record(&out_headers)?;
    }

    for (idx, row) in table.rows.iter().enumerate() {
        let mut out_row: Vec<String> = row.iter().map(|v| scrub(v)).collect();
        let status = match by_row_index.get(&idx) {
            Some(result) => {
                out_row.extend(agent_values(result).iter().map(|v| scrub(v)));
                result.status.to_string()
            }
            None => {
                out_row.extend(std::iter::repeat(String::new()).take(AGENT_COLUMNS.len()));
                String::new()
            }
        };
        writers[partition_for(&status)].write_record(&out_row)?;
    }

    let output = with_extension(output_zip, "zip");
    let file = File::create(&output)
        .with_context(|| format_err!("cannot create {}", output.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let names = ["found_agents.csv", "partial_agents.csv", "not_found.csv"];
    for (name, writer) in names.iter().zip(writers) {
        let bytes = writer
            .into_inner()
            .map_err(|err| format_err!("could not flush {}: {}", name, err))?;
        zip.start_file(*name, options)?;
        zip.write_all(&bytes)?;
    }
    zip.finish()?;

    Ok(output)
}

/// Export a flat per-row dump to CSV or Excel (CLI mode).
pub fn export_results(
    results: &[ScrapeResult],
    output_path: &Path,
    format: ExportFormat,
) -> Result<PathBuf> {
    let headers = [
        "original_address",
        "normalized_address",
        "city",
        "state",
        "zip",
        "agent_name",
        "brokerage",
        "agent_phone",
        "agent_email",
        "data_source",
        "listing_url",
        "list_date",
        "days_on_market",
        "listing_price",
        "lookup_status",
        "confidence",
        "verified",
        "sources_matched",
        "sources_tried",
        "error",
    ];

    let rows: Vec<Vec<String>> = results
        .iter()
        .map(|result| {
            let info = result.agent_info.clone().unwrap_or_default();
            vec![
                result.property.raw_address.clone(),
                result.property.normalized(),
                result.property.city.clone(),
                result.property.state.clone(),
                result.property.zip_code.clone(),
                info.agent_name,
                info.brokerage,
                info.phone,
                info.email,
                info.source,
                info.listing_url,
                info.list_date,
                info.days_on_market,
                info.listing_price,
                result.status.to_string(),
                format!("{:.2}", result.confidence),
                if result.verified { "Yes" } else { "No" }.to_owned(),
                result.sources_matched.join(", "),
                result.sources_tried.join(", "),
                result.error_message.clone(),
            ]
            .into_iter()
            .map(|v| scrub(&v))
            .collect()
        })
        .collect();

    match format {
        ExportFormat::Csv => {
            let output = with_extension(output_path, "csv");
            let mut writer = csv::Writer::from_path(&output)
                .with_context(|| format_err!("cannot create {}", output.display()))?;
            writer.write_record(headers)?;
            for row in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
            Ok(output)
        }
        ExportFormat::Excel => {
            let output = with_extension(output_path, "xlsx");
            let mut workbook = rust_xlsxwriter::Workbook::new();
            let sheet = workbook.add_worksheet();
            for (col, header) in headers.iter().enumerate() {
                sheet.write_string(0, col as u16, *header)?;
            }
            for (row_idx, row) in rows.iter().enumerate() {
                for (col, value) in row.iter().enumerate() {
                    sheet.write_string(row_idx as u32 + 1, col as u16, value)?;
                }
            }
            workbook.save(&output)?;
            Ok(output)
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExportFormat {
    Csv,
    Excel,
}

fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let current = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if current == ext || (ext == "xlsx" && current == "xls") {
        path.to_owned()
    } else {
        path.with_extension(ext)
    }
}

/// Batch summary, returned by the job API and printed by the CLI.
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub total: usize,
    pub found: usize,
    pub partial: usize,
    pub cached: usize,
    pub not_found: usize,
    pub errors: usize,
    pub success_rate: String,
    pub sources: HashMap<String, usize>,
}

pub fn generate_summary(results: &[ScrapeResult]) -> Summary {
    let count = |status: LookupStatus| results.iter().filter(|r| r.status == status).count();
    let total = results.len();
    let found = count(LookupStatus::Found);
    let partial = count(LookupStatus::Partial);
    let cached = count(LookupStatus::Cached);

    // Per-source breakdown, by the first segment of the provenance tag.
    let mut sources: HashMap<String, usize> = HashMap::new();
    for result in results {
        if let Some(info) = &result.agent_info {
            if !info.source.is_empty() {
                let first = info.source.split('+').next().unwrap_or("").to_owned();
                *sources.entry(first).or_insert(0) += 1;
            }
        }
    }

    let success_rate = if total > 0 {
        format!(
            "{:.1}%",
            (found + partial + cached) as f64 / total as f64 * 100.0
        )
    } else {
        "0%".to_owned()
    };

    Summary {
        total,
        found,
        partial,
        cached,
        not_found: count(LookupStatus::NotFound),
        errors: count(LookupStatus::Error),
        success_rate,
        sources,
    }
}

/// First `n` result rows as JSON objects, for the UI preview.
pub fn preview_rows(results: &[ScrapeResult], n: usize) -> Vec<serde_json::Value> {
    results
        .iter()
        .take(n)
        .map(|result| {
            let info = result.agent_info.clone().unwrap_or_default();
            json!({
                "address": scrub(&result.property.raw_address),
                "agent_name": scrub(&info.agent_name),
                "brokerage": scrub(&info.brokerage),
                "phone": scrub(&info.phone),
                "email": scrub(&info.email),
                "status": result.status.to_string(),
                "source": scrub(&info.source),
                "list_date": scrub(&info.list_date),
                "days_on_market": scrub(&info.days_on_market),
                "listing_price": scrub(&info.listing_price),
                "confidence": format!("{:.0}%", result.confidence * 100.0),
                "verified": result.verified,
            })
        })
        .collect()
}

/// Read the CSVs back out of a result archive as JSON rows.
pub fn read_archive_rows(zip_path: &Path) -> Result<Vec<serde_json::Value>> {
    let file = File::open(zip_path)
        .with_context(|| format_err!("cannot open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut rows = vec![];
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.name().ends_with(".csv") {
            continue;
        }
        let mut reader = csv::Reader::from_reader(entry);
        let headers = reader.headers()?.clone();
        for record in reader.records() {
            let record = record?;
            let mut row = serde_json::Map::new();
            for (header, value) in headers.iter().zip(record.iter()) {
                row.insert(header.to_owned(), json!(value));
            }
            rows.push(serde_json::Value::Object(row));
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentInfo, Property};
    use std::io::Write as _;

    fn result(row_index: usize, status: LookupStatus, name: &str) -> ScrapeResult {
        let mut result = ScrapeResult::new(Property {
            raw_address: format!("{} Main St", 100 + row_index),
            row_index,
            ..Property::default()
        });
        result.status = status;
        if !name.is_empty() {
            result.agent_info = Some(AgentInfo {
                agent_name: name.to_owned(),
                phone: "(555) 111-2222".to_owned(),
                source: "redfin".to_owned(),
                ..AgentInfo::default()
            });
        }
        result
    }

    #[test]
    fn zip_export_partitions_by_status_and_preserves_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        let mut file = File::create(&input).unwrap();
        writeln!(file, "address,custom_note").unwrap();
        writeln!(file, "100 Main St,keep me").unwrap();
        writeln!(file, "101 Main St,second").unwrap();
        writeln!(file, "102 Main St,third").unwrap();
        drop(file);

        let results = vec![
            result(0, LookupStatus::Found, "Jane Doe"),
            result(1, LookupStatus::Partial, "Bob Smith"),
            result(2, LookupStatus::NotFound, ""),
        ];

        let zip_path = dir.path().join("out.zip");
        let written = export_results_zip(&results, &input, &zip_path).unwrap();

        let rows = read_archive_rows(&written).unwrap();
        assert_eq!(rows.len(), 3);
        // Original columns survive the round trip.
        let found_row = rows
            .iter()
            .find(|r| r["lookup_status"] == "found")
            .unwrap();
        assert_eq!(found_row["custom_note"], "keep me");
        assert_eq!(found_row["agent_name"], "Jane Doe");
        assert_eq!(
            rows.iter().filter(|r| r["lookup_status"] == "partial").count(),
            1
        );
        assert_eq!(
            rows.iter()
                .filter(|r| r["lookup_status"] == "not_found")
                .count(),
            1
        );
    }

    #[test]
    fn row_index_alignment_survives_skipped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.csv");
        std::fs::write(&input, "address\n100 Main St\n\n102 Main St\n").unwrap();

        // Row 1 was blank, so only rows 0 and 2 have results.
        let results = vec![
            result(0, LookupStatus::Found, "Jane Doe"),
            result(2, LookupStatus::Found, "Bob Smith"),
        ];
        let written =
            export_results_zip(&results, &input, &dir.path().join("out.zip")).unwrap();
        let rows = read_archive_rows(&written).unwrap();

        let by_addr = |addr: &str| {
            rows.iter()
                .find(|r| r["address"] == addr)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_addr("100 Main St")["agent_name"], "Jane Doe");
        assert_eq!(by_addr("102 Main St")["agent_name"], "Bob Smith");
        // The blank row lands in not_found with empty agent columns.
        assert_eq!(by_addr("")["agent_name"], "");
    }

    #[test]
    fn summary_counts_and_source_breakdown() {
        let results = vec![
            result(0, LookupStatus::Found, "Jane Doe"),
            result(1, LookupStatus::Cached, "Bob Smith"),
            result(2, LookupStatus::NotFound, ""),
        ];
        let summary = generate_summary(&results);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.found, 1);
        assert_eq!(summary.cached, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.success_rate, "66.7%");
        assert_eq!(summary.sources.get("redfin"), Some(&2));
    }

    #[test]
    fn flat_csv_export_writes_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        let results = vec![result(0, LookupStatus::Found, "Jane Doe")];
        let written = export_results(&results, &out, ExportFormat::Csv).unwrap();
        assert!(written.extension().unwrap() == "csv");
        let content = std::fs::read_to_string(written).unwrap();
        assert!(content.contains("Jane Doe"));
        assert!(content.lines().count() == 2);
    }
}
