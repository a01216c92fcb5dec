//! The row/column shape every retrieval path is normalized into.
//!
//! Report payloads and bulk results look nothing alike on the wire. Both end up
//! as a [`TabularResult`] whose rows are exactly as wide as its header, with
//! missing cells rendered as empty strings.

use crate::error::Error;
use crate::reports::ReportPage;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io;
use tracing::warn;

/// Key Salesforce adds to JSON records for type metadata.
const RECORD_ATTRIBUTES_KEY: &str = "attributes";

/// Column labels and string cells.
///
/// Invariant: every row has `column_labels().len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TabularResult {
    column_labels: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TabularResult {
    /// Creates a result, padding short rows with `""` and truncating long ones.
    ///
    /// Truncated cells are logged at `warn` level since they are lost.
    pub fn new(column_labels: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = column_labels.len();
        let mut truncated_rows = 0usize;
        let mut dropped_cells = 0usize;
        let rows = rows
            .into_iter()
            .map(|mut row| {
                if row.len() > width {
                    truncated_rows += 1;
                    dropped_cells += row.len() - width;
                }
                row.resize(width, String::new());
                row
            })
            .collect();
        if dropped_cells > 0 {
            warn!(
                truncated_rows,
                dropped_cells,
                columns = width,
                "rows wider than the header were truncated"
            );
        }
        Self {
            column_labels,
            rows,
        }
    }

    /// Normalizes one Analytics report response.
    ///
    /// Rows of every fact-map bucket with a `rows` collection are
    /// concatenated in document order. Grouping is not reconstructed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload is not a report response.
    pub fn from_report_json(payload: Value) -> Result<Self, Error> {
        let page = ReportPage::from_json(payload)?;
        Ok(Self::new(page.column_labels, page.rows))
    }

    /// Normalizes bulk result rows under `header`.
    pub fn from_bulk_rows(rows: Vec<Vec<String>>, header: Vec<String>) -> Self {
        Self::new(header, rows)
    }

    /// Normalizes JSON records. Columns are the union of record keys in
    /// first-seen order; the `attributes` metadata key is dropped.
    pub fn from_bulk_records(records: Vec<Map<String, Value>>) -> Self {
        let mut header: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if key != RECORD_ATTRIBUTES_KEY && !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                header
                    .iter()
                    .map(|column| record.get(column).map(cell_text).unwrap_or_default())
                    .collect()
            })
            .collect();
        Self::new(header, rows)
    }

    /// Column labels, in output order.
    pub fn column_labels(&self) -> &[String] {
        &self.column_labels
    }

    /// Rows, each exactly as wide as [`column_labels`](Self::column_labels).
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows. A header may still be present.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits the result into column labels and rows.
    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<String>>) {
        (self.column_labels, self.rows)
    }

    /// Writes the header and rows as CSV.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Csv`] if writing fails.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), Error> {
        let mut writer = csv::Writer::from_writer(writer);
        writer
            .write_record(&self.column_labels)
            .map_err(|source| Error::Csv { source })?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|source| Error::Csv { source })?;
        }
        writer
            .flush()
            .map_err(|source| Error::Csv { source: source.into() })
    }
}

/// Renders a JSON value as a cell: strings verbatim, `null` as `""`,
/// anything else as its JSON text.
pub(crate) fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Collects bulk result pages. All pages of one job share a format.
#[derive(Debug, Default)]
pub(crate) struct BulkRows {
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
    records: Vec<Map<String, Value>>,
}

impl BulkRows {
    /// Adds a CSV page. Each page repeats the header line.
    pub(crate) fn push_csv(&mut self, body: &[u8]) -> Result<(), Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        if !self.records.is_empty() {
            return Err(Error::UnexpectedResponse(
                "bulk results mixed JSON and CSV pages".to_string(),
            ));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(body);
        let header: Vec<String> = reader
            .headers()
            .map_err(|source| Error::Csv { source })?
            .iter()
            .map(str::to_string)
            .collect();
        self.check_header(header)?;

        for record in reader.records() {
            let record = record.map_err(|source| Error::Csv { source })?;
            self.rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(())
    }

    /// Adds a JSON page: an array of records, or an array of arrays whose
    /// first entry is the header.
    pub(crate) fn push_json(&mut self, body: &[u8]) -> Result<(), Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let value: Value = serde_json::from_slice(body).map_err(|source| Error::Json { source })?;
        let Value::Array(entries) = value else {
            return Err(Error::UnexpectedResponse(
                "bulk JSON results must be an array".to_string(),
            ));
        };

        let first = entries.first().map(|entry| (entry.is_object(), entry.is_array()));
        match first {
            None => Ok(()),
            Some((true, _)) => {
                if self.header.is_some() {
                    return Err(Error::UnexpectedResponse(
                        "bulk results mixed JSON and CSV pages".to_string(),
                    ));
                }
                for entry in entries {
                    match entry {
                        Value::Object(record) => self.records.push(record),
                        _ => {
                            return Err(Error::UnexpectedResponse(
                                "bulk JSON records must all be objects".to_string(),
                            ))
                        }
                    }
                }
                Ok(())
            }
            Some((_, true)) => {
                if !self.records.is_empty() {
                    return Err(Error::UnexpectedResponse(
                        "bulk results mixed record and row pages".to_string(),
                    ));
                }
                let mut entries = entries.into_iter().map(|entry| match entry {
                    Value::Array(cells) => Ok(cells.iter().map(cell_text).collect::<Vec<_>>()),
                    _ => Err(Error::UnexpectedResponse(
                        "bulk JSON rows must all be arrays".to_string(),
                    )),
                });
                if let Some(header) = entries.next() {
                    self.check_header(header?)?;
                }
                for row in entries {
                    self.rows.push(row?);
                }
                Ok(())
            }
            Some(_) => Err(Error::UnexpectedResponse(
                "bulk JSON results must contain objects or arrays".to_string(),
            )),
        }
    }

    fn check_header(&mut self, header: Vec<String>) -> Result<(), Error> {
        match &self.header {
            None => {
                self.header = Some(header);
                Ok(())
            }
            Some(existing) if *existing == header => Ok(()),
            Some(_) => Err(Error::UnexpectedResponse(
                "bulk result pages have different headers".to_string(),
            )),
        }
    }

    pub(crate) fn finish(self) -> TabularResult {
        if self.records.is_empty() {
            TabularResult::from_bulk_rows(self.rows, self.header.unwrap_or_default())
        } else {
            TabularResult::from_bulk_records(self.records)
        }
    }
}
