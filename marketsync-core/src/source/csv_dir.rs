//! Offline source client backed by a directory of CSV files.
//!
//! Layout: `{dir}/{function}.csv`. A parameter whose name matches a column
//! header filters rows to those holding the parameter value; parameters
//! without a matching column are ignored.

use polars::prelude::DataFrame;
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::{SourceClient, SourceError};
use crate::field_mapper::Params;
use crate::frame::{records_to_frame, Document};

#[derive(Debug, Clone)]
pub struct CsvDirClient {
    dir: PathBuf,
}

impl CsvDirClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn function_path(&self, function: &str) -> PathBuf {
        self.dir.join(format!("{function}.csv"))
    }
}

/// Numbers stay numbers; empty cells are null.
fn parse_cell(cell: &str) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        // Keep zero-padded codes such as "000001" as text.
        if !(trimmed.len() > 1 && trimmed.starts_with('0')) {
            return Value::from(i);
        }
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() && !trimmed.starts_with("00") {
            return Value::from(f);
        }
    }
    Value::String(cell.to_string())
}

impl SourceClient for CsvDirClient {
    fn name(&self) -> &str {
        "csv_dir"
    }

    fn call(&self, function: &str, params: &Params) -> Result<DataFrame, SourceError> {
        let path = self.function_path(function);
        if !path.exists() {
            return Err(SourceError::UnknownFunction(function.to_string()));
        }

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SourceError::ResponseFormatChanged(format!("{}: {e}", path.display())))?
            .iter()
            .map(str::to_string)
            .collect();

        let filters: Vec<(usize, &str)> = params
            .iter()
            .filter_map(|(name, value)| {
                headers
                    .iter()
                    .position(|h| h == name)
                    .map(|idx| (idx, value.as_str()))
            })
            .collect();

        let mut records: Vec<Document> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| SourceError::ResponseFormatChanged(format!("{}: {e}", path.display())))?;
            if !filters
                .iter()
                .all(|(idx, value)| row.get(*idx).is_some_and(|cell| cell == *value))
            {
                continue;
            }
            let doc: Document = headers
                .iter()
                .zip(row.iter())
                .map(|(h, cell)| (h.clone(), parse_cell(cell)))
                .collect();
            records.push(doc);
        }

        records_to_frame(&records)
            .map_err(|e| SourceError::ResponseFormatChanged(format!("{function}: {e}")))
    }
}
