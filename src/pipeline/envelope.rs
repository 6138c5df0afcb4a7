//! Request and response envelopes.

use crate::error::{GatewayError, Result};
use crate::execution::rows_to_csv;
use crate::pipeline::state::{PipelineState, Stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub question: String,
}

impl PipelineRequest {
    pub fn new(question: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            question: question.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub question: String,
    pub sql_shown: String,
    pub answer_text: String,
    pub explanation: Option<String>,
    pub summary: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub markdown: String,
    pub row_count: usize,
    pub truncated: bool,
    pub fixes_applied: Vec<String>,
    pub warnings: Vec<String>,
    pub generation_attempts: usize,
    pub snapshot_version: u64,
    pub elapsed_ms: u64,
    pub trace: Vec<PipelineState>,
}

impl PipelineResponse {
    /// The returned rows as CSV with a header line.
    pub fn to_csv(&self) -> Result<String> {
        rows_to_csv(&self.columns, &self.rows)
    }
}

/// Terminal failure of a request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineFailure {
    pub request_id: Uuid,
    pub stage: Stage,
    /// Error class, e.g. `validation_rejected`.
    pub kind: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_shown: Option<String>,
    pub fixes_applied: Vec<String>,
    pub generation_attempts: usize,
    pub elapsed_ms: u64,
    pub trace: Vec<PipelineState>,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.reason)
    }
}

impl std::error::Error for PipelineFailure {}

/// Snake-case class name of an error, for envelopes and the history log.
pub fn error_kind(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::RetrievalUnavailable(_) => "retrieval_unavailable",
        GatewayError::GenerationFailed(_) => "generation_failed",
        GatewayError::ValidationRejected(_) => "validation_rejected",
        GatewayError::ExecutionFailed(_) => "execution_failed",
        GatewayError::SummarizationDegraded(_) => "summarization_degraded",
        GatewayError::Timeout { .. } => "timeout",
        GatewayError::Cancelled { .. } => "cancelled",
        GatewayError::Metadata(_) => "metadata",
        GatewayError::Llm(_) => "llm",
        GatewayError::Embedding(_) => "embedding",
        GatewayError::Index(_) => "index",
        GatewayError::Sql(_) => "sql",
        GatewayError::Config(_) => "config",
        GatewayError::History(_) => "history",
        GatewayError::Io(_) => "io",
        GatewayError::Json(_) => "json",
        GatewayError::Polars(_) => "polars",
    }
}

/// Message of an error without the class prefix `Display` adds.
pub fn error_reason(err: &GatewayError) -> String {
    match err {
        GatewayError::RetrievalUnavailable(m)
        | GatewayError::GenerationFailed(m)
        | GatewayError::ExecutionFailed(m)
        | GatewayError::SummarizationDegraded(m) => m.clone(),
        GatewayError::ValidationRejected(rejection) => rejection.reason.clone(),
        GatewayError::Cancelled { .. } => "request cancelled".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserializes_without_id() {
        let request: PipelineRequest = serde_json::from_str(r#"{"question": "total sales"}"#).unwrap();
        assert_eq!(request.question, "total sales");
        assert!(!request.request_id.is_nil());
    }

    #[test]
    fn test_error_reason_strips_prefix() {
        let err = GatewayError::ExecutionFailed("column \"qty\" not found".to_string());
        assert_eq!(error_kind(&err), "execution_failed");
        assert_eq!(error_reason(&err), "column \"qty\" not found");

        let err = GatewayError::Timeout {
            stage: Stage::Generation,
            timeout_ms: 10,
        };
        assert_eq!(error_reason(&err), "generation timed out after 10ms");
    }

    #[test]
    fn test_response_rows_export_as_csv() {
        let response = PipelineResponse {
            request_id: Uuid::new_v4(),
            question: "price by sku".to_string(),
            sql_shown: "SELECT sku, price FROM international_sales LIMIT 100".to_string(),
            answer_text: String::new(),
            explanation: None,
            summary: String::new(),
            columns: vec!["sku".to_string(), "price".to_string()],
            rows: vec![
                vec![serde_json::json!("A"), serde_json::json!(10.5)],
                vec![serde_json::json!("B, large"), serde_json::Value::Null],
            ],
            markdown: String::new(),
            row_count: 2,
            truncated: false,
            fixes_applied: Vec::new(),
            warnings: Vec::new(),
            generation_attempts: 0,
            snapshot_version: 1,
            elapsed_ms: 3,
            trace: Vec::new(),
        };
        assert_eq!(response.to_csv().unwrap(), "sku,price\nA,10.5\n\"B, large\",\n");
    }
}
