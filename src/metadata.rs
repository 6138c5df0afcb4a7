//! Metadata Store
//!
//! Table and column descriptors grouped into immutable, versioned snapshots.
//! Writers build a complete snapshot and swap the shared pointer; readers
//! clone the `Arc` and keep serving whatever snapshot they started with.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Summary statistics captured at ingestion time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    #[serde(default)]
    pub samples: Vec<serde_json::Value>,
    #[serde(default)]
    pub null_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub table_name: String,
    pub column_name: String,
    pub datatype: String,
    #[serde(default)]
    pub summary: ColumnSummary,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ColumnDescriptor {
    pub fn new(table_name: &str, column_name: &str, datatype: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            column_name: column_name.to_string(),
            datatype: datatype.to_string(),
            summary: ColumnSummary::default(),
            tags: infer_tags(column_name, datatype),
        }
    }

    pub fn with_samples(mut self, samples: Vec<serde_json::Value>) -> Self {
        self.summary.samples = samples;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub table_name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default)]
    pub row_count_estimate: Option<u64>,
}

impl TableDescriptor {
    pub fn new(table_name: &str, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            table_name: table_name.to_string(),
            columns,
            row_count_estimate: None,
        }
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.column_name.eq_ignore_ascii_case(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column_name.as_str()).collect()
    }
}

/// Tags derived from the declared type and the column name.
pub fn infer_tags(column_name: &str, datatype: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let dtype = datatype.to_lowercase();
    let name = column_name.to_lowercase();

    if ["int", "float", "double", "decimal", "numeric", "real", "f32", "f64", "i32", "i64", "u32", "u64"]
        .iter()
        .any(|t| dtype.contains(t))
    {
        tags.insert("numeric".to_string());
    } else if ["date", "time", "timestamp", "datetime"]
        .iter()
        .any(|t| dtype.contains(t))
    {
        tags.insert("temporal".to_string());
    } else if dtype.contains("bool") {
        tags.insert("boolean".to_string());
    } else if ["str", "char", "text", "utf8"].iter().any(|t| dtype.contains(t)) {
        tags.insert("text".to_string());
    }

    if name == "id" || name.ends_with("_id") || name == "sku" || name.ends_with("_key") {
        tags.insert("identifier".to_string());
    }
    tags
}

/// Immutable, versioned view of every registered table.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataSnapshot {
    version: u64,
    created_at: DateTime<Utc>,
    /// Keyed by lowercase table name.
    tables: BTreeMap<String, TableDescriptor>,
}

impl MetadataSnapshot {
    fn build(version: u64, tables: Vec<TableDescriptor>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for table in tables {
            let key = table.table_name.to_lowercase();
            if key.is_empty() {
                return Err(GatewayError::Metadata("Table name must not be empty".to_string()));
            }
            let mut seen = BTreeSet::new();
            for column in &table.columns {
                if !seen.insert(column.column_name.to_lowercase()) {
                    return Err(GatewayError::Metadata(format!(
                        "Duplicate column '{}' in table '{}'",
                        column.column_name, table.table_name
                    )));
                }
            }
            if map.insert(key, table).is_some() {
                return Err(GatewayError::Metadata(
                    "Duplicate table name in snapshot".to_string(),
                ));
            }
        }
        Ok(Self {
            version,
            created_at: Utc::now(),
            tables: map,
        })
    }

    pub fn empty() -> Self {
        Self {
            version: 0,
            created_at: Utc::now(),
            tables: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup.
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnDescriptor> {
        self.table(table).and_then(|t| t.column(column))
    }

    /// Tables in lexical order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.values().map(|t| t.table_name.as_str()).collect()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.tables.values().flat_map(|t| t.columns.iter())
    }
}

/// Shared holder of the current snapshot.
pub struct MetadataStore {
    current: RwLock<Arc<MetadataSnapshot>>,
    next_version: AtomicU64,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(MetadataSnapshot::empty())),
            next_version: AtomicU64::new(1),
        }
    }

    pub fn with_tables(tables: Vec<TableDescriptor>) -> Result<Self> {
        let store = Self::new();
        store.replace_snapshot(tables)?;
        Ok(store)
    }

    /// Current snapshot. The read guard is held only for the pointer clone.
    pub fn get_snapshot(&self) -> Arc<MetadataSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Build a new snapshot and swap it in. Returns the new version.
    pub fn replace_snapshot(&self, tables: Vec<TableDescriptor>) -> Result<u64> {
        let snapshot = self.prepare(tables)?;
        Ok(self.publish(snapshot))
    }

    /// Build the next snapshot without installing it. Readers keep seeing
    /// the current one until `publish`.
    pub fn prepare(&self, tables: Vec<TableDescriptor>) -> Result<Arc<MetadataSnapshot>> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MetadataSnapshot::build(version, tables)?))
    }

    /// Swap a prepared snapshot in. Returns its version.
    pub fn publish(&self, snapshot: Arc<MetadataSnapshot>) -> u64 {
        let version = snapshot.version;
        let table_count = snapshot.tables.len();

        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
        drop(guard);

        info!("Metadata snapshot v{} installed ({} tables)", version, table_count);
        version
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk descriptor format written by the ingestion job
/// (`<table>_metadata.json`).
#[derive(Debug, Deserialize)]
struct IngestedMetadata {
    table: String,
    #[serde(default)]
    row_count: Option<u64>,
    columns: Vec<IngestedColumn>,
    #[serde(default)]
    samples: HashMap<String, Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct IngestedColumn {
    column_name: String,
    #[serde(default = "unknown_type")]
    column_type: String,
}

fn unknown_type() -> String {
    "UNKNOWN".to_string()
}

/// Parse one ingestion metadata document.
pub fn parse_ingested_metadata(raw: &str) -> Result<TableDescriptor> {
    let doc: IngestedMetadata = serde_json::from_str(raw)?;
    let columns = doc
        .columns
        .iter()
        .map(|c| {
            let samples = doc.samples.get(&c.column_name).cloned().unwrap_or_default();
            ColumnDescriptor::new(&doc.table, &c.column_name, &c.column_type).with_samples(samples)
        })
        .collect();
    Ok(TableDescriptor {
        table_name: doc.table,
        columns,
        row_count_estimate: doc.row_count,
    })
}

/// Read every `*_metadata.json` file in a directory, sorted by file name.
pub fn load_metadata_dir(dir: &Path) -> Result<Vec<TableDescriptor>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("_metadata.json"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut tables = Vec::new();
    for path in paths {
        let raw = std::fs::read_to_string(&path)?;
        match parse_ingested_metadata(&raw) {
            Ok(table) => tables.push(table),
            Err(e) => warn!("Skipping unreadable metadata file {}: {}", path.display(), e),
        }
    }
    info!("Loaded {} table descriptors from {}", tables.len(), dir.display());
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales_table() -> TableDescriptor {
        TableDescriptor::new(
            "international_sales",
            vec![
                ColumnDescriptor::new("international_sales", "sku", "VARCHAR"),
                ColumnDescriptor::new("international_sales", "price", "DOUBLE"),
                ColumnDescriptor::new("international_sales", "region", "VARCHAR"),
            ],
        )
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let store = MetadataStore::with_tables(vec![sales_table()]).unwrap();
        let snapshot = store.get_snapshot();
        assert!(snapshot.table("International_Sales").is_some());
        assert!(snapshot.column("international_sales", "PRICE").is_some());
        assert!(snapshot.column("international_sales", "cost").is_none());
    }

    #[test]
    fn test_replace_bumps_version_and_keeps_old_readers() {
        let store = MetadataStore::with_tables(vec![sales_table()]).unwrap();
        let before = store.get_snapshot();
        let v2 = store
            .replace_snapshot(vec![TableDescriptor::new("orders", vec![])])
            .unwrap();

        assert!(v2 > before.version());
        assert!(before.table("international_sales").is_some());
        let after = store.get_snapshot();
        assert_eq!(after.version(), v2);
        assert!(after.table("international_sales").is_none());
        assert!(after.table("orders").is_some());
    }

    #[test]
    fn test_duplicate_tables_rejected_and_snapshot_unchanged() {
        let store = MetadataStore::with_tables(vec![sales_table()]).unwrap();
        let version = store.get_snapshot().version();
        let result = store.replace_snapshot(vec![sales_table(), sales_table()]);
        assert!(result.is_err());
        assert_eq!(store.get_snapshot().version(), version);
    }

    #[test]
    fn test_prepared_snapshot_is_invisible_until_published() {
        let store = MetadataStore::with_tables(vec![sales_table()]).unwrap();
        let version = store.get_snapshot().version();

        let prepared = store.prepare(vec![TableDescriptor::new("orders", vec![])]).unwrap();
        assert!(prepared.version() > version);
        assert_eq!(store.get_snapshot().version(), version);
        assert!(store.get_snapshot().table("orders").is_none());

        // dropping an unpublished snapshot leaves the store untouched
        drop(prepared);
        assert_eq!(store.get_snapshot().version(), version);

        let next = store.prepare(vec![TableDescriptor::new("orders", vec![])]).unwrap();
        let published = store.publish(next);
        assert_eq!(store.get_snapshot().version(), published);
        assert!(store.get_snapshot().table("orders").is_some());
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_snapshot() {
        let store = Arc::new(MetadataStore::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = store.get_snapshot();
                    // Every writer installs `n` tables each with `n` columns.
                    let n = snapshot.tables().count();
                    for table in snapshot.tables() {
                        assert_eq!(table.columns.len(), n);
                    }
                }
            }));
        }
        for n in 1..50usize {
            let tables = (0..n)
                .map(|t| {
                    let name = format!("t{}", t);
                    let cols = (0..n)
                        .map(|c| ColumnDescriptor::new(&name, &format!("c{}", c), "INTEGER"))
                        .collect();
                    TableDescriptor::new(&name, cols)
                })
                .collect();
            store.replace_snapshot(tables).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_parse_ingested_metadata() {
        let raw = r#"{
            "table": "cloud_warehouse",
            "row_count": 200,
            "columns": [
                {"column_name": "Provider", "column_type": "VARCHAR"},
                {"column_name": "Storage Cost", "column_type": "DOUBLE"}
            ],
            "samples": {"Provider": ["AWS", "Azure", "GCP"]}
        }"#;
        let table = parse_ingested_metadata(raw).unwrap();
        assert_eq!(table.table_name, "cloud_warehouse");
        assert_eq!(table.row_count_estimate, Some(200));
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].summary.samples.len(), 3);
        assert!(table.columns[1].summary.samples.is_empty());
        assert!(table.columns[1].tags.contains("numeric"));
    }

    #[test]
    fn test_infer_tags() {
        assert!(infer_tags("customer_id", "BIGINT").contains("identifier"));
        assert!(infer_tags("customer_id", "BIGINT").contains("numeric"));
        assert!(infer_tags("order_date", "DATE").contains("temporal"));
        assert!(infer_tags("region", "VARCHAR").contains("text"));
    }
}
