//! Schema RAG
//!
//! Embedding-based retrieval of table and column descriptors.

pub mod embedder;
pub mod retriever;
pub mod vector_store;

pub use embedder::{embedder_from_config, Embedder, Embedding, HashingEmbedder, OpenAiEmbedder};
pub use retriever::{RetrievalContext, RetrievalHit, RetrievalStage, SchemaIndexer, TableContext};
pub use vector_store::{DescriptorId, InMemoryVectorStore, IndexEntry, IndexSnapshotId, VectorIndex};
