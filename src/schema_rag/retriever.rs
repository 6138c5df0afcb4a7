//! Schema RAG Retriever
//!
//! Retrieves relevant schema information using vector search, and builds the
//! index from the metadata snapshot.

use crate::error::{GatewayError, Result};
use crate::metadata::{MetadataSnapshot, TableDescriptor};
use crate::schema_rag::embedder::Embedder;
use crate::schema_rag::vector_store::{DescriptorId, IndexEntry, IndexSnapshotId, VectorIndex};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One ranked descriptor hit.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalHit {
    pub id: DescriptorId,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnContext {
    pub column_name: String,
    pub datatype: String,
    pub samples: Vec<serde_json::Value>,
    pub score: f32,
}

/// Hits for one table, in relevance order.
#[derive(Debug, Clone, Serialize)]
pub struct TableContext {
    pub table_name: String,
    pub row_count_estimate: Option<u64>,
    pub columns: Vec<ColumnContext>,
}

/// Retrieved schema information
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalContext {
    pub query_text: String,
    /// Descending score, ties by `(table, column)`.
    pub hits: Vec<RetrievalHit>,
    /// Tables ordered by their best hit.
    pub grouped_tables: Vec<TableContext>,
    pub snapshot_version: u64,
    /// Retrieval was unavailable and the context is intentionally empty.
    pub degraded: bool,
}

impl RetrievalContext {
    pub fn degraded(query_text: &str, snapshot_version: u64) -> Self {
        Self {
            query_text: query_text.to_string(),
            hits: Vec::new(),
            grouped_tables: Vec::new(),
            snapshot_version,
            degraded: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.grouped_tables.iter().map(|t| t.table_name.as_str()).collect()
    }

    /// Compact schema block for a prompt.
    ///
    /// ```text
    /// TABLE: international_sales
    ///   columns:
    ///     - region (str) - samples: EMEA, APAC
    /// ```
    pub fn schema_block(&self, max_columns_per_table: usize) -> String {
        if self.grouped_tables.is_empty() {
            return String::new();
        }
        let mut parts = vec!["# Dataset Schema:".to_string()];
        for table in &self.grouped_tables {
            parts.push(format!("TABLE: {}", table.table_name));
            parts.push("  columns:".to_string());
            for column in table.columns.iter().take(max_columns_per_table) {
                let samples = column
                    .samples
                    .iter()
                    .take(3)
                    .map(render_sample)
                    .collect::<Vec<_>>()
                    .join(", ");
                let samples = if samples.is_empty() { "no-samples".to_string() } else { samples };
                parts.push(format!(
                    "    - {} ({}) - samples: {}",
                    column.column_name, column.datatype, samples
                ));
            }
            parts.push(String::new());
        }
        parts.join("\n")
    }

    /// `table.column` names flattened in relevance order, deduplicated.
    pub fn recommended_columns(&self) -> Vec<String> {
        let mut ranked: Vec<(f32, String, String)> = self
            .grouped_tables
            .iter()
            .flat_map(|t| {
                t.columns
                    .iter()
                    .map(move |c| (c.score, t.table_name.clone(), c.column_name.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| (&a.1, &a.2).cmp(&(&b.1, &b.2))));
        let mut seen = HashSet::new();
        ranked
            .into_iter()
            .filter(|(_, t, c)| seen.insert((t.clone(), c.clone())))
            .map(|(_, t, c)| format!("{}.{}", t, c))
            .collect()
    }

    /// Full context section handed to the SQL generator.
    pub fn prompt_context(&self, max_columns_per_table: usize) -> String {
        if self.degraded {
            return "# Schema retrieval is unavailable; use only tables you are certain exist.".to_string();
        }
        let recommended = self.recommended_columns();
        let rec_block = if recommended.is_empty() {
            "- none".to_string()
        } else {
            recommended
                .iter()
                .take(20)
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "{}\n# Recommended columns (by relevance):\n{}",
            self.schema_block(max_columns_per_table),
            rec_block
        )
    }
}

fn render_sample(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct RetrievalStage {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl RetrievalStage {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self {
            embedder,
            index,
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Embed the question once, search once, and rank the hits against the
    /// given snapshot. Index or embedding failures surface as
    /// `RetrievalUnavailable`.
    pub async fn retrieve(&self, question: &str, snapshot: &MetadataSnapshot) -> Result<RetrievalContext> {
        let embedding = self
            .embedder
            .embed(question)
            .await
            .map_err(|e| GatewayError::RetrievalUnavailable(e.to_string()))?;
        let raw = self
            .index
            .search(&embedding, self.top_k)
            .await
            .map_err(|e| GatewayError::RetrievalUnavailable(e.to_string()))?;

        let mut hits: Vec<RetrievalHit> = raw
            .into_iter()
            .filter(|(id, _)| match &id.column {
                Some(column) => snapshot.column(&id.table, column).is_some(),
                None => snapshot.table(&id.table).is_some(),
            })
            .map(|(id, score)| RetrievalHit { id, score })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(self.top_k);

        debug!("Retrieved {} hits for {:?}", hits.len(), question);
        let grouped_tables = group_hits(&hits, snapshot);
        Ok(RetrievalContext {
            query_text: question.to_string(),
            hits,
            grouped_tables,
            snapshot_version: snapshot.version(),
            degraded: false,
        })
    }
}

/// Group ranked hits by table. A table-level hit pulls in the table's
/// remaining columns at the table's score.
fn group_hits(hits: &[RetrievalHit], snapshot: &MetadataSnapshot) -> Vec<TableContext> {
    let mut groups: Vec<TableContext> = Vec::new();
    for hit in hits {
        let Some(table) = snapshot.table(&hit.id.table) else {
            continue;
        };
        let pos = match groups
            .iter()
            .position(|g| g.table_name.eq_ignore_ascii_case(&table.table_name))
        {
            Some(pos) => pos,
            None => {
                groups.push(TableContext {
                    table_name: table.table_name.clone(),
                    row_count_estimate: table.row_count_estimate,
                    columns: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[pos];
        match &hit.id.column {
            Some(column) => {
                if let Some(descriptor) = table.column(column) {
                    push_column(group, descriptor, hit.score);
                }
            }
            None => {
                for descriptor in &table.columns {
                    push_column(group, descriptor, hit.score);
                }
            }
        }
    }
    groups
}

fn push_column(group: &mut TableContext, descriptor: &crate::metadata::ColumnDescriptor, score: f32) {
    if group
        .columns
        .iter()
        .any(|c| c.column_name.eq_ignore_ascii_case(&descriptor.column_name))
    {
        return;
    }
    group.columns.push(ColumnContext {
        column_name: descriptor.column_name.clone(),
        datatype: descriptor.datatype.clone(),
        samples: descriptor.summary.samples.clone(),
        score,
    });
}

/// Builds index documents from a snapshot and rebuilds the index.
pub struct SchemaIndexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    batch_size: usize,
}

impl SchemaIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, batch_size: usize) -> Self {
        Self {
            embedder,
            index,
            batch_size: batch_size.max(1),
        }
    }

    /// One document per table plus one per column.
    pub fn documents(snapshot: &MetadataSnapshot) -> Vec<(DescriptorId, String)> {
        let mut docs = Vec::new();
        for table in snapshot.tables() {
            docs.push((DescriptorId::table(&table.table_name), table_text(table)));
            for column in &table.columns {
                let samples = column
                    .summary
                    .samples
                    .iter()
                    .map(render_sample)
                    .collect::<Vec<_>>()
                    .join(", ");
                let samples = if samples.is_empty() { "no-samples".to_string() } else { samples };
                let text = format!(
                    "table: {}; column: {}; type: {}; samples: {}",
                    table.table_name, column.column_name, column.datatype, samples
                );
                docs.push((DescriptorId::column(&table.table_name, &column.column_name), text));
            }
        }
        docs
    }

    pub async fn build(&self, snapshot: &MetadataSnapshot) -> Result<IndexSnapshotId> {
        let docs = Self::documents(snapshot);
        let mut entries = Vec::with_capacity(docs.len());
        for chunk in docs.chunks(self.batch_size) {
            let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            for ((id, text), embedding) in chunk.iter().cloned().zip(embeddings) {
                entries.push(IndexEntry { id, text, embedding });
            }
        }
        info!(
            "Indexing {} descriptors from metadata snapshot v{}",
            entries.len(),
            snapshot.version()
        );
        self.index.rebuild(entries).await
    }
}

fn table_text(table: &TableDescriptor) -> String {
    let mut parts = vec![format!("Table: {}", table.table_name)];
    parts.push(format!("Columns: {}", table.column_names().join(", ")));
    if let Some(rows) = table.row_count_estimate {
        parts.push(format!("Rows: {}", rows));
    }
    parts.join(". ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnDescriptor, MetadataStore};
    use crate::schema_rag::embedder::HashingEmbedder;
    use crate::schema_rag::vector_store::InMemoryVectorStore;
    use async_trait::async_trait;

    fn sales_store() -> MetadataStore {
        MetadataStore::with_tables(vec![
            TableDescriptor::new(
                "international_sales",
                vec![
                    ColumnDescriptor::new("international_sales", "region", "str")
                        .with_samples(vec![serde_json::json!("EMEA"), serde_json::json!("APAC")]),
                    ColumnDescriptor::new("international_sales", "price", "f64"),
                    ColumnDescriptor::new("international_sales", "sku", "str"),
                ],
            ),
            TableDescriptor::new(
                "warehouses",
                vec![ColumnDescriptor::new("warehouses", "capacity_m3", "i64")],
            ),
        ])
        .unwrap()
    }

    struct FixedIndex(Vec<(DescriptorId, f32)>);

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn search(&self, _query: &[f32], k: usize) -> Result<Vec<(DescriptorId, f32)>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }

        async fn rebuild(&self, _entries: Vec<IndexEntry>) -> Result<IndexSnapshotId> {
            Err(GatewayError::Index("read-only".to_string()))
        }
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<(DescriptorId, f32)>> {
            Err(GatewayError::Index("connection refused".to_string()))
        }

        async fn rebuild(&self, _entries: Vec<IndexEntry>) -> Result<IndexSnapshotId> {
            Err(GatewayError::Index("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_hits_sorted_and_stale_dropped() {
        let store = sales_store();
        let snapshot = store.get_snapshot();
        let index = FixedIndex(vec![
            (DescriptorId::column("international_sales", "sku"), 0.5),
            (DescriptorId::column("international_sales", "region"), 0.9),
            (DescriptorId::column("dropped_table", "x"), 0.95),
            (DescriptorId::column("international_sales", "price"), 0.9),
        ]);
        let stage = RetrievalStage::new(Arc::new(HashingEmbedder::new(16)), Arc::new(index), 8);
        let ctx = stage.retrieve("total sales by region", &snapshot).await.unwrap();

        let ids: Vec<String> = ctx.hits.iter().map(|h| h.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "international_sales.price",
                "international_sales.region",
                "international_sales.sku"
            ]
        );
        assert!(ctx.hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(ctx.grouped_tables.len(), 1);
        assert_eq!(ctx.snapshot_version, snapshot.version());
        assert!(!ctx.degraded);
    }

    #[tokio::test]
    async fn test_index_failure_is_retrieval_unavailable() {
        let store = sales_store();
        let stage = RetrievalStage::new(Arc::new(HashingEmbedder::new(16)), Arc::new(DownIndex), 8);
        let err = stage
            .retrieve("total sales", &store.get_snapshot())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn test_index_build_and_search_end_to_end() {
        let store = sales_store();
        let snapshot = store.get_snapshot();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let index = Arc::new(InMemoryVectorStore::new(256));

        let indexer = SchemaIndexer::new(embedder.clone(), index.clone(), 2);
        indexer.build(&snapshot).await.unwrap();
        // 2 tables + 4 columns
        assert_eq!(index.len(), 6);

        let stage = RetrievalStage::new(embedder, index, 4);
        let ctx = stage.retrieve("total sales by region", &snapshot).await.unwrap();
        assert!(ctx.hits.len() <= 4);
        assert_eq!(ctx.grouped_tables[0].table_name, "international_sales");

        let block = ctx.schema_block(10);
        assert!(block.contains("TABLE: international_sales"));
        assert!(ctx.prompt_context(10).contains("# Recommended columns"));
    }

    #[test]
    fn test_schema_block_format() {
        let store = sales_store();
        let snapshot = store.get_snapshot();
        let hits = vec![RetrievalHit {
            id: DescriptorId::column("international_sales", "region"),
            score: 0.8,
        }];
        let ctx = RetrievalContext {
            query_text: "q".to_string(),
            grouped_tables: group_hits(&hits, &snapshot),
            hits,
            snapshot_version: snapshot.version(),
            degraded: false,
        };
        assert_eq!(
            ctx.schema_block(10),
            "# Dataset Schema:\nTABLE: international_sales\n  columns:\n    - region (str) - samples: EMEA, APAC\n"
        );
        assert_eq!(ctx.recommended_columns(), vec!["international_sales.region"]);
    }
}
