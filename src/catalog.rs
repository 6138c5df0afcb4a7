//! Data catalog
//!
//! Builds table descriptors straight from the files the engine serves:
//! one table per `.csv` / `.parquet` file, with dtypes, row counts, null
//! counts and a few distinct sample values per column.

use crate::error::Result;
use crate::execution::polars_engine::discover_tables;
use crate::execution::result::series_to_json_value;
use crate::metadata::{ColumnDescriptor, ColumnSummary, TableDescriptor};
use polars::prelude::*;
use std::path::Path;
use tracing::{info, warn};

const SAMPLE_VALUES: usize = 3;

/// Describe every table file in `data_dir`. Unreadable files are skipped
/// with a warning.
pub fn describe_data_dir(data_dir: &Path) -> Result<Vec<TableDescriptor>> {
    let mut tables = Vec::new();
    for source in discover_tables(data_dir)? {
        let df = match source.scan().and_then(|lf| Ok(lf.collect()?)) {
            Ok(df) => df,
            Err(e) => {
                warn!("Skipping {}: {}", source.path.display(), e);
                continue;
            }
        };
        tables.push(describe_frame(&source.name, &df)?);
    }
    info!("Described {} tables in {}", tables.len(), data_dir.display());
    Ok(tables)
}

pub fn describe_frame(table_name: &str, df: &DataFrame) -> Result<TableDescriptor> {
    let mut columns = Vec::with_capacity(df.width());
    for series in df.get_columns() {
        let datatype = series.dtype().to_string();
        let samples = sample_values(series)?;
        let mut column = ColumnDescriptor::new(table_name, series.name(), &datatype);
        column.summary = ColumnSummary {
            samples,
            null_count: Some(series.null_count() as u64),
        };
        columns.push(column);
    }
    let mut table = TableDescriptor::new(table_name, columns);
    table.row_count_estimate = Some(df.height() as u64);
    Ok(table)
}

fn sample_values(series: &Series) -> Result<Vec<serde_json::Value>> {
    let distinct = series.drop_nulls().unique_stable()?;
    let take = distinct.len().min(SAMPLE_VALUES);
    (0..take).map(|i| series_to_json_value(&distinct, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_frame() {
        let df = df! {
            "sku" => &["A", "A", "B", "C", "D"],
            "price" => &[Some(1.0f64), None, Some(2.0), Some(2.0), Some(3.5)],
        }
        .unwrap();
        let table = describe_frame("international_sales", &df).unwrap();
        assert_eq!(table.row_count_estimate, Some(5));

        let sku = table.column("sku").unwrap();
        assert_eq!(sku.summary.samples, vec![json!("A"), json!("B"), json!("C")]);
        assert!(sku.tags.contains("identifier"));
        assert!(sku.tags.contains("text"));

        let price = table.column("price").unwrap();
        assert_eq!(price.summary.null_count, Some(1));
        assert!(price.tags.contains("numeric"));
    }

    #[test]
    fn test_describe_data_dir_reads_csv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("orders.csv"),
            "order_id,region,amount\n1,EMEA,10.5\n2,APAC,3.0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let tables = describe_data_dir(dir.path()).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_name, "orders");
        assert_eq!(tables[0].column_names(), vec!["order_id", "region", "amount"]);
        assert_eq!(tables[0].row_count_estimate, Some(2));
    }
}
