//! Execution stage
//!
//! Bounds a validated query by the row ceiling, dispatches it to the engine
//! under a timeout and reports whether rows were cut off. Engine failures are
//! terminal; nothing here retries.

use crate::error::{GatewayError, Result};
use crate::execution::engine::{AnalyticalEngine, ExecutionContext};
use crate::execution::result::ExecutionResult;
use crate::pipeline::Stage;
use crate::sql::analysis::number_literal;
use crate::sql::{check_read_only, parse_query};
use sqlparser::ast::{Expr, Query, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// SQL after the row ceiling is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedQuery {
    /// What the user sees: limited to at most the ceiling.
    pub shown: String,
    /// What the engine runs: one row past the ceiling when the ceiling is
    /// the binding limit, so truncation can be detected.
    pub dispatched: String,
}

/// Apply the row ceiling to `sql`.
///
/// No limit: `LIMIT ceiling` is set. An explicit limit above the ceiling is
/// lowered to it. A limit at or below the ceiling is left alone. Queries
/// whose limit is not a plain number, or that use `FETCH`, are wrapped in an
/// outer select.
pub fn bound_query(sql: &str, ceiling: usize) -> Result<BoundedQuery> {
    let query = parse_query(sql)?;
    let wrap = |n: usize| format!("SELECT * FROM ({}) AS bounded LIMIT {}", query, n);
    let with_limit = |n: usize| {
        let mut limited: Query = query.clone();
        limited.limit = Some(Expr::Value(Value::Number(n.to_string(), false)));
        limited.to_string()
    };

    if query.fetch.is_some() && query.limit.is_none() {
        return Ok(BoundedQuery {
            shown: wrap(ceiling),
            dispatched: wrap(ceiling + 1),
        });
    }

    match query.limit.as_ref().map(number_literal) {
        None => Ok(BoundedQuery {
            shown: with_limit(ceiling),
            dispatched: with_limit(ceiling + 1),
        }),
        Some(Some(value)) if value > ceiling as u64 => Ok(BoundedQuery {
            shown: with_limit(ceiling),
            dispatched: with_limit(ceiling + 1),
        }),
        Some(Some(_)) => {
            let text = query.to_string();
            Ok(BoundedQuery {
                shown: text.clone(),
                dispatched: text,
            })
        }
        // LIMIT <expr>
        Some(None) => Ok(BoundedQuery {
            shown: wrap(ceiling),
            dispatched: wrap(ceiling + 1),
        }),
    }
}

pub struct ExecutionStage {
    engine: Arc<dyn AnalyticalEngine>,
    row_ceiling: usize,
    timeout: Duration,
}

impl ExecutionStage {
    pub fn new(engine: Arc<dyn AnalyticalEngine>, row_ceiling: usize, timeout: Duration) -> Self {
        Self {
            engine,
            row_ceiling,
            timeout,
        }
    }

    pub fn engine(&self) -> &Arc<dyn AnalyticalEngine> {
        &self.engine
    }

    pub fn row_ceiling(&self) -> usize {
        self.row_ceiling
    }

    /// Execute validated SQL. Returns the SQL as shown to the user and the
    /// bounded result.
    pub async fn execute(&self, sql: &str) -> Result<(String, ExecutionResult)> {
        check_read_only(sql).map_err(|v| GatewayError::ExecutionFailed(v.to_string()))?;
        let bounded = bound_query(sql, self.row_ceiling)
            .map_err(|e| GatewayError::ExecutionFailed(e.to_string()))?;
        check_read_only(&bounded.dispatched).map_err(|v| GatewayError::ExecutionFailed(v.to_string()))?;

        let ctx = ExecutionContext::new(self.row_ceiling, self.timeout);
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.engine.execute(&bounded.dispatched, &ctx)).await;

        let result = match outcome {
            Err(_) => {
                warn!("{} engine timed out after {:?}", self.engine.name(), self.timeout);
                return Err(GatewayError::Timeout {
                    stage: Stage::Execution,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            Ok(Err(GatewayError::ExecutionFailed(msg))) => return Err(GatewayError::ExecutionFailed(msg)),
            Ok(Err(e)) => return Err(GatewayError::ExecutionFailed(e.to_string())),
            Ok(Ok(result)) => result,
        };

        let mut rows = result.rows;
        let truncated = rows.len() > self.row_ceiling;
        rows.truncate(self.row_ceiling);
        let elapsed = start.elapsed();
        info!(
            "{} returned {} rows in {:?}{}",
            result.engine_name,
            rows.len(),
            elapsed,
            if truncated { " (truncated)" } else { "" }
        );

        Ok((
            bounded.shown,
            ExecutionResult {
                columns: result.columns,
                row_count: rows.len(),
                rows,
                truncated,
                elapsed,
            },
        ))
    }
}
