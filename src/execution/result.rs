//! Query Result - what engines hand back and what the pipeline shows

use crate::error::{GatewayError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rows returned by an engine, already converted to JSON values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Engine that executed the query
    pub engine_name: String,

    pub execution_time_ms: u64,

    /// Warnings (non-fatal issues)
    pub warnings: Vec<String>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>, engine_name: &str) -> Self {
        Self {
            columns,
            rows,
            engine_name: engine_name.to_string(),
            execution_time_ms: 0,
            warnings: Vec::new(),
        }
    }

    /// Convert a collected DataFrame.
    pub fn from_dataframe(df: &DataFrame, engine_name: &str, execution_time_ms: u64) -> Result<Self> {
        let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        let rows = dataframe_to_rows(df)?;
        Ok(Self {
            columns,
            rows,
            engine_name: engine_name.to_string(),
            execution_time_ms,
            warnings: Vec::new(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Tabular outcome of the execution stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    /// More rows existed than the ceiling allowed.
    pub truncated: bool,
    #[serde(rename = "elapsed_ms", with = "duration_ms")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as column-name keyed objects, for API responses.
    pub fn records(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<serde_json::Map<_, _>>()
            })
            .collect()
    }

    /// Render rows as CSV with a header line.
    pub fn to_csv(&self) -> Result<String> {
        rows_to_csv(&self.columns, &self.rows)
    }
}

/// CSV text for a header and rows, cells rendered by `cell_text`.
pub fn rows_to_csv(columns: &[String], rows: &[Vec<serde_json::Value>]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(columns)
        .map_err(|e| GatewayError::ExecutionFailed(format!("CSV export failed: {}", e)))?;
    for row in rows {
        writer
            .write_record(row.iter().map(cell_text))
            .map_err(|e| GatewayError::ExecutionFailed(format!("CSV export failed: {}", e)))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| GatewayError::ExecutionFailed(format!("CSV export failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| GatewayError::ExecutionFailed(e.to_string()))
}

/// Display text for one cell: strings unquoted, nulls empty.
pub fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<Vec<serde_json::Value>>> {
    let columns = df.get_columns();
    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut row = Vec::with_capacity(columns.len());
        for series in columns {
            row.push(series_to_json_value(series, row_idx)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

pub(crate) fn series_to_json_value(series: &Series, row_idx: usize) -> Result<serde_json::Value> {
    let any_val = series
        .get(row_idx)
        .map_err(|e| GatewayError::ExecutionFailed(format!("Failed to get value: {}", e)))?;

    match any_val {
        AnyValue::Null => Ok(serde_json::Value::Null),
        AnyValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        AnyValue::String(s) => Ok(serde_json::Value::String(s.to_string())),
        AnyValue::StringOwned(ref s) => Ok(serde_json::Value::String(s.to_string())),
        AnyValue::Int8(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int16(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int32(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::Int64(i) => Ok(serde_json::Value::Number(i.into())),
        AnyValue::UInt8(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt16(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt32(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::UInt64(u) => Ok(serde_json::Value::Number(u.into())),
        AnyValue::Float32(f) => Ok(serde_json::Number::from_f64(f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        AnyValue::Float64(f) => Ok(serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        // dates, times, decimals: polars' own display form
        other => Ok(serde_json::Value::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_dataframe_converts_values() {
        let df = df! {
            "region" => &["EMEA", "APAC"],
            "revenue" => &[10.5f64, 3.0],
            "orders" => &[Some(2i64), None],
        }
        .unwrap();
        let result = QueryResult::from_dataframe(&df, "polars", 3).unwrap();
        assert_eq!(result.columns, vec!["region", "revenue", "orders"]);
        assert_eq!(result.rows[0], vec![json!("EMEA"), json!(10.5), json!(2)]);
        assert_eq!(result.rows[1][2], serde_json::Value::Null);
        assert_eq!(result.row_count(), 2);
    }

    #[test]
    fn test_records_and_csv() {
        let result = ExecutionResult {
            columns: vec!["sku".to_string(), "qty".to_string()],
            rows: vec![vec![json!("A-1"), json!(4)], vec![json!("B,2"), serde_json::Value::Null]],
            row_count: 2,
            truncated: false,
            elapsed: Duration::from_millis(12),
        };
        assert_eq!(result.records()[0]["sku"], json!("A-1"));
        assert_eq!(result.to_csv().unwrap(), "sku,qty\nA-1,4\n\"B,2\",\n");

        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["elapsed_ms"], json!(12));
    }
}
