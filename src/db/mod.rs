//! Local persistence
//!
//! SQLite-backed log of answered and failed requests.

pub mod query_history;

pub use query_history::{HistoryEntry, QueryHistory};
