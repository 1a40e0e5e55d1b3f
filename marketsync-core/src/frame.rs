//! Tabular helpers over Polars DataFrames.
//!
//! Source results travel through the engine as `DataFrame`s. These helpers
//! cover the handful of operations the engine needs: building frames from
//! JSON records, backfilling parameter columns, stamping the scrape time,
//! reordering by declared fields, stacking frames with differing schemas, and
//! turning rows into documents for a store.

use chrono::{DateTime, Local};
use polars::prelude::*;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::field_mapper::Params;

/// A stored row: field name → JSON value.
pub type Document = Map<String, Value>;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("polars: {0}")]
    Polars(#[from] PolarsError),

    #[error("column '{0}' not found")]
    MissingColumn(String),
}

/// Build a frame from JSON records. Column order follows first appearance.
///
/// A column whose non-null values are all integers becomes `Int64`, all
/// numbers `Float64`, all booleans `Boolean`; anything else is stored as text.
pub fn records_to_frame(records: &[Document]) -> Result<DataFrame, FrameError> {
    let mut names: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(&key.as_str()) {
                names.push(key.as_str());
            }
        }
    }

    let columns = names
        .iter()
        .map(|name| {
            let cells: Vec<Option<&Value>> = records
                .iter()
                .map(|r| r.get(*name).filter(|v| !v.is_null()))
                .collect();
            build_column(name, &cells)
        })
        .collect::<Vec<_>>();

    Ok(DataFrame::new(columns)?)
}

fn build_column(name: &str, cells: &[Option<&Value>]) -> Column {
    let present = || cells.iter().flatten();
    if present().all(|v| v.is_i64()) && present().next().is_some() {
        let values: Vec<Option<i64>> = cells.iter().map(|c| c.and_then(Value::as_i64)).collect();
        return Column::new(name.into(), values);
    }
    if present().all(|v| v.is_number()) && present().next().is_some() {
        let values: Vec<Option<f64>> = cells.iter().map(|c| c.and_then(Value::as_f64)).collect();
        return Column::new(name.into(), values);
    }
    if present().all(|v| v.is_boolean()) && present().next().is_some() {
        let values: Vec<Option<bool>> = cells.iter().map(|c| c.and_then(Value::as_bool)).collect();
        return Column::new(name.into(), values);
    }
    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| {
            c.map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .collect();
    Column::new(name.into(), values)
}

/// Every cell of a column rendered as text; nulls are `None`.
pub fn column_strings(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, FrameError> {
    let column = df
        .column(name)
        .map_err(|_| FrameError::MissingColumn(name.to_string()))?;
    (0..df.height())
        .map(|i| Ok(cell_string(column.get(i)?)))
        .collect()
}

fn cell_string(value: AnyValue<'_>) -> Option<String> {
    match value {
        AnyValue::Null => None,
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        other => Some(other.to_string()),
    }
}

fn cell_json(value: AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int8(v) => v.into(),
        AnyValue::Int16(v) => v.into(),
        AnyValue::Int32(v) => v.into(),
        AnyValue::Int64(v) => v.into(),
        AnyValue::UInt8(v) => v.into(),
        AnyValue::UInt16(v) => v.into(),
        AnyValue::UInt32(v) => v.into(),
        AnyValue::UInt64(v) => v.into(),
        AnyValue::Float32(v) => float_json(v as f64),
        AnyValue::Float64(v) => float_json(v),
        other => Value::String(other.to_string()),
    }
}

/// NaN and infinities have no JSON form and are stored as null.
fn float_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Rows of a frame as documents, in row order.
pub fn frame_to_documents(df: &DataFrame) -> Result<Vec<Document>, FrameError> {
    let mut docs: Vec<Document> = (0..df.height()).map(|_| Document::new()).collect();
    for column in df.get_columns() {
        let name = column.name().to_string();
        for (i, doc) in docs.iter_mut().enumerate() {
            doc.insert(name.clone(), cell_json(column.get(i)?));
        }
    }
    Ok(docs)
}

/// A text column holding `value` in every row.
fn constant_column(name: &str, value: &str, height: usize) -> Column {
    Column::new(name.into(), vec![value.to_string(); height])
}

/// Write each `(param, column)` parameter value into its output column.
///
/// The parameter is authoritative: blank cells are filled with it, and if any
/// non-blank cell disagrees the whole column is replaced and a warning is
/// logged. In every case the column ends up holding the parameter value.
pub fn backfill_param_columns(
    mut df: DataFrame,
    add_param_columns: &[(String, String)],
    params: &Params,
    collection: &str,
) -> Result<DataFrame, FrameError> {
    let height = df.height();
    for (param, column) in add_param_columns {
        let Some(value) = params.get(param) else {
            continue;
        };
        if df.column(column).is_ok() {
            let cells = column_strings(&df, column)?;
            let conflicts = cells
                .iter()
                .flatten()
                .filter(|c| !c.trim().is_empty() && c.as_str() != value)
                .count();
            if conflicts > 0 {
                warn!(
                    collection,
                    column = %column,
                    param = %param,
                    value = %value,
                    conflicts,
                    "column disagrees with its parameter, overwriting with the parameter value"
                );
            }
        }
        df.with_column(constant_column(column, value, height))?;
    }
    Ok(df)
}

/// Set `field` to the scrape time on every row.
pub fn stamp_timestamp(
    mut df: DataFrame,
    field: &str,
    now: DateTime<Local>,
) -> Result<DataFrame, FrameError> {
    let stamp = now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    let height = df.height();
    df.with_column(constant_column(field, &stamp, height))?;
    Ok(df)
}

/// Put declared fields first, in declaration order; other columns follow in
/// their existing order.
pub fn reorder_columns(df: DataFrame, field_order: &[String]) -> Result<DataFrame, FrameError> {
    if field_order.is_empty() {
        return Ok(df);
    }
    let existing: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
    let mut ordered: Vec<String> = field_order
        .iter()
        .filter(|f| existing.contains(f))
        .cloned()
        .collect();
    for name in &existing {
        if !ordered.contains(name) {
            ordered.push(name.clone());
        }
    }
    if ordered == existing {
        return Ok(df);
    }
    Ok(df.select(ordered)?)
}

/// Stack frames whose schemas may differ. Missing columns are null-filled;
/// a column whose type differs between frames is stored as text.
pub fn concat_frames(frames: Vec<DataFrame>) -> Result<DataFrame, FrameError> {
    let mut frames = frames.into_iter().filter(|f| f.height() > 0);
    let Some(first) = frames.next() else {
        return Ok(DataFrame::empty());
    };
    let rest: Vec<DataFrame> = frames.collect();
    if rest.is_empty() {
        return Ok(first);
    }

    let mut schema: Vec<(String, DataType)> = Vec::new();
    for frame in std::iter::once(&first).chain(rest.iter()) {
        for column in frame.get_columns() {
            let name = column.name().to_string();
            if let Some(idx) = schema.iter().position(|(n, _)| *n == name) {
                if schema[idx].1 != *column.dtype() {
                    schema[idx].1 = DataType::String;
                }
            } else {
                schema.push((name, column.dtype().clone()));
            }
        }
    }

    let mut stacked = conform(&first, &schema)?;
    for frame in &rest {
        stacked.vstack_mut(&conform(frame, &schema)?)?;
    }
    Ok(stacked)
}

fn conform(df: &DataFrame, schema: &[(String, DataType)]) -> Result<DataFrame, FrameError> {
    let height = df.height();
    let columns = schema
        .iter()
        .map(|(name, dtype)| match df.column(name) {
            Ok(column) if column.dtype() == dtype => Ok(column.clone()),
            Ok(column) => Ok(column.cast(dtype)?),
            Err(_) => Ok(Column::from(Series::full_null(name.as_str().into(), height, dtype))),
        })
        .collect::<Result<Vec<_>, FrameError>>()?;
    Ok(DataFrame::new(columns)?)
}
