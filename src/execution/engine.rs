//! Analytical Engine Trait - contract for anything that runs read-only SQL

use crate::error::Result;
use crate::execution::result::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution context passed to engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Maximum rows the caller will show. Engines return at most
    /// `fetch_limit()` rows so the caller can tell whether more existed.
    pub row_ceiling: usize,

    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn new(row_ceiling: usize, timeout: Duration) -> Self {
        Self { row_ceiling, timeout }
    }

    pub fn fetch_limit(&self) -> usize {
        self.row_ceiling.saturating_add(1)
    }
}

#[async_trait]
pub trait AnalyticalEngine: Send + Sync {
    /// Engine name (e.g., "polars")
    fn name(&self) -> &'static str;

    /// Run one read-only statement.
    async fn execute(&self, sql: &str, ctx: &ExecutionContext) -> Result<QueryResult>;

    async fn health_check(&self) -> Result<bool>;
}
