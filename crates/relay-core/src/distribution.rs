//! Tab-separated distribution files carried inside [`ResultFile`]s.

use crate::{Error, ResultFile, Result};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

pub const GENERIC_FILE_NAME: &str = "code.distribution";
pub const DEMOGRAPHICS_FILE_NAME: &str = "demographics.distribution";

pub const HEADER: [&str; 15] = [
    "BIOBANK",
    "CODE",
    "COUNT",
    "DESCRIPTION",
    "MIN",
    "Q1",
    "MEDIAN",
    "MEAN",
    "Q3",
    "MAX",
    "ALTERNATIVES",
    "DATASET",
    "CATEGORY",
    "OMOP",
    "OMOP_DESCR",
];

/// One row of a distribution file. Statistics columns are carried verbatim.
///
/// Serialized column names match [`HEADER`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct DistributionRow {
    pub biobank: String,
    pub code: String,
    pub count: i64,
    pub description: String,
    pub min: String,
    pub q1: String,
    pub median: String,
    pub mean: String,
    pub q3: String,
    pub max: String,
    pub alternatives: String,
    pub dataset: String,
    pub category: String,
    pub omop: String,
    pub omop_descr: String,
}

/// Parse a distribution file. Columns are located by header name (case-insensitive), so column
/// order and extra columns do not matter. Rows without a code or whose count is not an integer
/// are skipped.
pub fn parse_tsv(text: &str) -> Result<Vec<DistributionRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let header: csv::StringRecord = reader
        .headers()
        .context("read distribution header")?
        .iter()
        .map(|h| h.to_ascii_uppercase())
        .collect();
    if header.is_empty() || header.iter().all(str::is_empty) {
        return Err(Error::msg("distribution file is empty"));
    }
    for required in ["CODE", "COUNT"] {
        if !header.iter().any(|h| h == required) {
            return Err(Error::msg(format!(
                "distribution file has no {required} column"
            )));
        }
    }
    reader.set_headers(header);

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize::<DistributionRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(
                    event = "relay.distribution.row.skipped",
                    line = line + 2,
                    error = %err,
                    "skipping malformed distribution row"
                );
                continue;
            }
        };
        if row.code.is_empty() {
            continue;
        }
        rows.push(row);
    }

    Ok(rows)
}

pub fn write_tsv(rows: &[DistributionRow]) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(Vec::new());

    writer
        .write_record(HEADER)
        .context("write distribution header")?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("write distribution row {}", row.code))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| Error::msg(format!("flush distribution file: {err}")))?;
    let text = String::from_utf8(bytes).context("distribution file must be utf-8")?;
    Ok(text)
}

impl ResultFile {
    /// Build a distribution file from rows.
    pub fn distribution(name: &str, description: &str, rows: &[DistributionRow]) -> Result<Self> {
        let text = write_tsv(rows)?;
        Ok(Self {
            file_name: name.to_string(),
            file_data: STANDARD.encode(text.as_bytes()),
            file_description: Some(description.to_string()),
            file_reference: String::new(),
            file_sensitive: true,
            file_size: text.len() as f64 / 1_000_000.0,
            file_type: "BCOS".to_string(),
        })
    }

    pub fn decode_text(&self) -> Result<String> {
        let bytes = STANDARD
            .decode(self.file_data.trim())
            .with_context(|| format!("decode base64 of {}", self.file_name))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{} must be utf-8", self.file_name))?;
        Ok(text)
    }

    pub fn rows(&self) -> Result<Vec<DistributionRow>> {
        parse_tsv(&self.decode_text()?)
    }
}

/// Parse an `ALTERNATIVES` cell of the form `^Female|12^Male|30^`.
///
/// Pairs whose value is not an integer are skipped.
pub fn parse_alternatives(cell: &str) -> Vec<(String, i64)> {
    cell.split('^')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('|')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim().parse::<i64>().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

pub fn format_alternatives(pairs: &[(String, i64)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let mut out = String::from("^");
    for (key, value) in pairs {
        out.push_str(key);
        out.push('|');
        out.push_str(&value.to_string());
        out.push('^');
    }
    out
}
