//! Vector Store Abstraction
//!
//! The index adapter the retrieval stage talks to. The in-memory store does a
//! linear cosine scan over an immutable entry set that `rebuild` swaps whole,
//! so searches never see a half-built index.

use crate::error::{GatewayError, Result};
use crate::schema_rag::embedder::Embedding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Identifies a descriptor: a whole table, or one column of it.
///
/// Ordering is `(table, column)` with the table-level id before its columns,
/// which is the tie-break order for equal scores.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DescriptorId {
    pub table: String,
    pub column: Option<String>,
}

impl DescriptorId {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            column: None,
        }
    }

    pub fn column(table: &str, column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: Some(column.to_string()),
        }
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}.{}", self.table, column),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Document in the vector store
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: DescriptorId,
    pub text: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexSnapshotId(pub u64);

impl fmt::Display for IndexSnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index-{}", self.0)
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` nearest descriptors, best first.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(DescriptorId, f32)>>;

    /// Replace the whole index.
    async fn rebuild(&self, entries: Vec<IndexEntry>) -> Result<IndexSnapshotId>;
}

struct IndexState {
    id: IndexSnapshotId,
    entries: Vec<IndexEntry>,
}

pub struct InMemoryVectorStore {
    dimension: usize,
    state: RwLock<Arc<IndexState>>,
    next_id: AtomicU64,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            state: RwLock::new(Arc::new(IndexState {
                id: IndexSnapshotId(0),
                entries: Vec::new(),
            })),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn current(&self) -> Result<Arc<IndexState>> {
        self.state
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| GatewayError::Index("Vector index lock poisoned".to_string()))
    }

    pub fn snapshot_id(&self) -> Result<IndexSnapshotId> {
        Ok(self.current()?.id)
    }

    pub fn len(&self) -> usize {
        self.current().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorStore {
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(DescriptorId, f32)>> {
        if query.len() != self.dimension {
            return Err(GatewayError::Index(format!(
                "Query embedding dimension {} doesn't match store dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let state = self.current()?;

        let mut results: Vec<(DescriptorId, f32)> = state
            .entries
            .iter()
            .map(|entry| (entry.id.clone(), cosine_similarity(query, &entry.embedding)))
            .collect();

        results.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    async fn rebuild(&self, entries: Vec<IndexEntry>) -> Result<IndexSnapshotId> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.embedding.len() != self.dimension {
                return Err(GatewayError::Index(format!(
                    "Embedding dimension {} for {} doesn't match store dimension {}",
                    entry.embedding.len(),
                    entry.id,
                    self.dimension
                )));
            }
            if !seen.insert(&entry.id) {
                return Err(GatewayError::Index(format!("Duplicate index entry: {}", entry.id)));
            }
        }

        let id = IndexSnapshotId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let count = entries.len();
        let state = Arc::new(IndexState { id, entries });
        let mut guard = self
            .state
            .write()
            .map_err(|_| GatewayError::Index("Vector index lock poisoned".to_string()))?;
        *guard = state;
        info!("Rebuilt vector index {} with {} entries", id, count);
        Ok(id)
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(table: &str, column: Option<&str>, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: DescriptorId {
                table: table.to_string(),
                column: column.map(|c| c.to_string()),
            },
            text: String::new(),
            embedding,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 1.0);

        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_id() {
        let store = InMemoryVectorStore::new(2);
        store
            .rebuild(vec![
                entry("sales", Some("region"), vec![1.0, 0.0]),
                entry("sales", None, vec![1.0, 0.0]),
                entry("orders", Some("amount"), vec![1.0, 0.0]),
                entry("sales", Some("price"), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 3).await.unwrap();
        let ids: Vec<String> = hits.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["orders.amount", "sales", "sales.region"]);
    }

    #[tokio::test]
    async fn test_rebuild_rejects_bad_entries_and_keeps_old_index() {
        let store = InMemoryVectorStore::new(2);
        let first = store
            .rebuild(vec![entry("sales", None, vec![1.0, 0.0])])
            .await
            .unwrap();

        let err = store.rebuild(vec![entry("sales", None, vec![1.0])]).await;
        assert!(err.is_err());
        let err = store
            .rebuild(vec![
                entry("sales", None, vec![1.0, 0.0]),
                entry("sales", None, vec![0.0, 1.0]),
            ])
            .await;
        assert!(err.is_err());

        assert_eq!(store.snapshot_id().unwrap(), first);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_search_dimension_mismatch() {
        let store = InMemoryVectorStore::new(3);
        assert!(store.search(&[1.0], 5).await.is_err());
        assert!(store.search(&[1.0, 0.0, 0.0], 5).await.unwrap().is_empty());
    }
}
