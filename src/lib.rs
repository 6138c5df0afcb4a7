pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod fuzzy_matcher;
pub mod gateway;
pub mod generation;
pub mod llm;
pub mod metadata;
pub mod pipeline;
pub mod schema_rag;
pub mod sql;
pub mod summarization;
pub mod validation;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
