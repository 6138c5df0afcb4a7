//! Execution
//!
//! Pluggable analytical engines plus the stage that bounds and runs
//! validated SQL against them.

pub mod engine;
pub mod polars_engine;
pub mod result;
pub mod stage;

pub use engine::{AnalyticalEngine, ExecutionContext};
pub use polars_engine::{discover_tables, PolarsEngine, TableFormat, TableSource};
pub use result::{cell_text, rows_to_csv, ExecutionResult, QueryResult};
pub use stage::{bound_query, BoundedQuery, ExecutionStage};
