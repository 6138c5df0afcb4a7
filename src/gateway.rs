//! Gateway
//!
//! Wires configuration into concrete components: the catalog-backed metadata
//! store, the schema index, the model clients, the Polars engine and the
//! optional query history. Binaries talk to this type only.

use crate::catalog::describe_data_dir;
use crate::config::GatewayConfig;
use crate::db::{HistoryEntry, QueryHistory};
use crate::error::{GatewayError, Result};
use crate::execution::{AnalyticalEngine, PolarsEngine};
use crate::generation::LlmSqlGenerator;
use crate::llm::{LlmClient, TextModel};
use crate::metadata::{load_metadata_dir, MetadataSnapshot, MetadataStore, TableDescriptor};
use crate::pipeline::{PipelineController, PipelineDeps, PipelineFailure, PipelineRequest, PipelineResponse};
use crate::schema_rag::{embedder_from_config, InMemoryVectorStore, IndexSnapshotId, SchemaIndexer};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReindexSummary {
    pub snapshot_version: u64,
    pub index_snapshot: String,
    pub tables: usize,
    pub columns: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub engine: String,
    pub engine_ok: bool,
    pub llm: String,
    pub snapshot_version: u64,
    pub tables: usize,
    pub indexed_descriptors: usize,
}

pub struct Gateway {
    config: GatewayConfig,
    metadata: Arc<MetadataStore>,
    index: Arc<InMemoryVectorStore>,
    indexer: SchemaIndexer,
    llm: Arc<dyn TextModel>,
    controller: PipelineController,
    history: Option<QueryHistory>,
    reindex_lock: Mutex<()>,
}

impl Gateway {
    /// Build every component from configuration and index the data directory.
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let embedder = embedder_from_config(&config.embedding, &config.llm)?;
        let index = Arc::new(InMemoryVectorStore::new(embedder.dimension()));
        let llm: Arc<dyn TextModel> = Arc::new(LlmClient::new(config.llm.clone()));
        let generator = Arc::new(LlmSqlGenerator::new(
            llm.clone(),
            config.llm.max_tokens,
            config.llm.strict_max_tokens,
            config.retrieval.max_columns_per_table,
        ));
        let engine: Arc<dyn AnalyticalEngine> = Arc::new(PolarsEngine::new(config.data_dir.clone()));
        let metadata = Arc::new(MetadataStore::new());

        let deps = PipelineDeps {
            metadata: metadata.clone(),
            embedder: embedder.clone(),
            index: index.clone(),
            generator,
            engine,
            summarizer: llm.clone(),
        };
        let controller = PipelineController::new(&config, deps);
        let indexer = SchemaIndexer::new(embedder, index.clone(), config.embedding.batch_size);

        let history = match &config.history_path {
            Some(path) => Some(QueryHistory::open(path)?),
            None => None,
        };

        info!("Gateway using {} over {}", llm.describe(), config.data_dir.display());
        let gateway = Self {
            config,
            metadata,
            index,
            indexer,
            llm,
            controller,
            history,
            reindex_lock: Mutex::new(()),
        };
        gateway.reindex().await?;
        Ok(gateway)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Descriptors for the data directory, with `<table>_metadata.json`
    /// declarations taking precedence for tables the engine can serve.
    pub fn load_tables(config: &GatewayConfig) -> Result<Vec<TableDescriptor>> {
        let mut tables = describe_data_dir(&config.data_dir)?;
        if let Some(dir) = &config.metadata_dir {
            for declared in load_metadata_dir(dir)? {
                match tables
                    .iter_mut()
                    .find(|t| t.table_name.eq_ignore_ascii_case(&declared.table_name))
                {
                    Some(existing) => *existing = declared,
                    None => warn!(
                        "Metadata for '{}' has no data file in {}; ignored",
                        declared.table_name,
                        config.data_dir.display()
                    ),
                }
            }
        }
        Ok(tables)
    }

    /// Re-read the data directory, rebuild the schema index and then swap in
    /// the new metadata snapshot. Concurrent calls run one at a time; a
    /// failure anywhere leaves the published snapshot in place.
    pub async fn reindex(&self) -> Result<ReindexSummary> {
        let _guard = self.reindex_lock.lock().await;
        let config = self.config.clone();
        let tables = tokio::task::spawn_blocking(move || Self::load_tables(&config))
            .await
            .map_err(|e| GatewayError::Metadata(format!("Catalog task failed: {}", e)))??;

        let (snapshot, index_snapshot) = install(&self.metadata, &self.indexer, tables).await?;
        let summary = ReindexSummary {
            snapshot_version: snapshot.version(),
            index_snapshot: index_snapshot.to_string(),
            tables: snapshot.table_names().len(),
            columns: snapshot.columns().count(),
        };
        info!(
            "Reindexed: snapshot v{}, {} tables, {} columns",
            summary.snapshot_version, summary.tables, summary.columns
        );
        Ok(summary)
    }

    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.metadata.get_snapshot()
    }

    pub async fn ask(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        let outcome = self.controller.run(request, cancel).await;
        self.record(&request.question, &outcome);
        outcome
    }

    pub async fn run_sql(&self, sql: &str) -> std::result::Result<PipelineResponse, PipelineFailure> {
        let outcome = self.controller.run_sql(Uuid::new_v4(), sql, &CancellationToken::new()).await;
        self.record(sql, &outcome);
        outcome
    }

    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        match &self.history {
            Some(history) => history.recent(limit),
            None => Ok(Vec::new()),
        }
    }

    pub async fn health(&self) -> HealthReport {
        let engine = self.controller.engine();
        let snapshot = self.metadata.get_snapshot();
        HealthReport {
            engine: engine.name().to_string(),
            engine_ok: engine.health_check().await.unwrap_or(false),
            llm: self.llm.describe(),
            snapshot_version: snapshot.version(),
            tables: snapshot.table_names().len(),
            indexed_descriptors: self.index.len(),
        }
    }

    /// History write failures are logged, never surfaced.
    fn record(&self, question: &str, outcome: &std::result::Result<PipelineResponse, PipelineFailure>) {
        let Some(history) = &self.history else {
            return;
        };
        let entry = match outcome {
            Ok(response) => HistoryEntry::completed(response),
            Err(failure) => HistoryEntry::failed(question, failure),
        };
        if let Err(e) = history.record(&entry) {
            warn!("Failed to record query history: {}", e);
        }
    }
}

/// Index a prepared snapshot, publishing it only once the index is built.
async fn install(
    metadata: &MetadataStore,
    indexer: &SchemaIndexer,
    tables: Vec<TableDescriptor>,
) -> Result<(Arc<MetadataSnapshot>, IndexSnapshotId)> {
    let snapshot = metadata.prepare(tables)?;
    let index_snapshot = indexer.build(&snapshot).await?;
    metadata.publish(snapshot.clone());
    Ok((snapshot, index_snapshot))
}
