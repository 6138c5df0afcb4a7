//! Polars Engine - in-process SQL over the `.csv` / `.parquet` files of a
//! data directory. Each file is one table named after its stem.

use crate::error::{GatewayError, Result};
use crate::execution::engine::{AnalyticalEngine, ExecutionContext};
use crate::execution::result::QueryResult;
use crate::sql::check_read_only;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    Parquet,
}

/// A table backed by one file.
#[derive(Debug, Clone, Serialize)]
pub struct TableSource {
    pub name: String,
    pub path: PathBuf,
    pub format: TableFormat,
}

impl TableSource {
    pub fn scan(&self) -> Result<LazyFrame> {
        match self.format {
            TableFormat::Csv => LazyCsvReader::new(&self.path)
                .with_has_header(true)
                .with_infer_schema_length(Some(1000))
                .finish()
                .map_err(|e| GatewayError::ExecutionFailed(format!("Failed to load CSV {}: {}", self.name, e))),
            TableFormat::Parquet => LazyFrame::scan_parquet(&self.path, ScanArgsParquet::default())
                .map_err(|e| GatewayError::ExecutionFailed(format!("Failed to load Parquet {}: {}", self.name, e))),
        }
    }
}

/// Tables found in `data_dir`, sorted by name. A parquet file wins over a
/// csv file with the same stem.
pub fn discover_tables(data_dir: &Path) -> Result<Vec<TableSource>> {
    let mut tables: Vec<TableSource> = Vec::new();
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let format = match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
            Some(ext) if ext == "csv" => TableFormat::Csv,
            Some(ext) if ext == "parquet" => TableFormat::Parquet,
            _ => continue,
        };
        let name = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };

        match tables.iter_mut().find(|t| t.name.eq_ignore_ascii_case(&name)) {
            Some(existing) => {
                if format == TableFormat::Parquet {
                    existing.path = path;
                    existing.format = format;
                }
            }
            None => tables.push(TableSource { name, path, format }),
        }
    }
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tables)
}

pub struct PolarsEngine {
    data_dir: PathBuf,
}

impl PolarsEngine {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn run(data_dir: &Path, sql: &str, fetch_limit: usize) -> Result<DataFrame> {
        let mut ctx = SQLContext::new();
        for table in discover_tables(data_dir)? {
            debug!("Registering table {} ({:?})", table.name, table.format);
            ctx.register(&table.name, table.scan()?);
        }

        let lf = ctx
            .execute(sql)
            .map_err(|e| GatewayError::ExecutionFailed(format!("Polars SQL error: {}", e)))?;
        lf.limit(fetch_limit.min(IdxSize::MAX as usize) as IdxSize)
            .collect()
            .map_err(|e| GatewayError::ExecutionFailed(format!("Failed to collect DataFrame: {}", e)))
    }
}

#[async_trait]
impl AnalyticalEngine for PolarsEngine {
    fn name(&self) -> &'static str {
        "polars"
    }

    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult> {
        check_read_only(sql).map_err(|v| GatewayError::ExecutionFailed(v.to_string()))?;

        let start_time = std::time::Instant::now();
        info!("Executing query with Polars: {}", sql);

        let data_dir = self.data_dir.clone();
        let statement = sql.to_string();
        let fetch_limit = ctx.fetch_limit();
        let df = tokio::task::spawn_blocking(move || Self::run(&data_dir, &statement, fetch_limit))
            .await
            .map_err(|e| GatewayError::ExecutionFailed(format!("Execution task failed: {}", e)))??;

        let execution_time = start_time.elapsed().as_millis() as u64;
        QueryResult::from_dataframe(&df, self.name(), execution_time)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.data_dir.is_dir())
    }
}
