//! Summarization
//!
//! Rows + question -> a narrated answer and a table. A model failure never
//! fails the request: the answer keeps its table and deterministic summary
//! and loses only the explanation.

use crate::error::{GatewayError, Result};
use crate::execution::{cell_text, ExecutionResult};
use crate::llm::TextModel;
use crate::pipeline::Stage;
use itertools::Itertools;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NO_ROWS_MARKDOWN: &str = "_No results returned from SQL query._";
const NO_ROWS_SUMMARY: &str = "No results found.";
/// Rows included in the model prompt.
const PROMPT_ROWS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct TableView {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub markdown: String,
}

impl TableView {
    pub fn from_result(result: &ExecutionResult) -> Self {
        Self {
            columns: result.columns.clone(),
            rows: result.rows.clone(),
            markdown: render_markdown(&result.columns, &result.rows),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub explanation: Option<String>,
    pub table: TableView,
    pub summary: String,
    /// Why the explanation is missing, when it is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl Answer {
    /// Explanation when available, else the plain summary.
    pub fn text(&self) -> &str {
        self.explanation.as_deref().unwrap_or(&self.summary)
    }
}

pub fn render_markdown(columns: &[String], rows: &[Vec<serde_json::Value>]) -> String {
    if rows.is_empty() {
        return NO_ROWS_MARKDOWN.to_string();
    }
    let escape = |s: String| s.replace('|', "\\|").replace('\n', " ");
    let mut out = String::new();
    out.push_str(&format!(
        "| {} |\n",
        columns.iter().map(|c| escape(c.clone())).collect::<Vec<_>>().join(" | ")
    ));
    out.push_str(&format!("|{}\n", " --- |".repeat(columns.len())));
    for row in rows {
        out.push_str(&format!(
            "| {} |\n",
            row.iter().map(|v| escape(cell_text(v))).collect::<Vec<_>>().join(" | ")
        ));
    }
    out.trim_end().to_string()
}

/// Deterministic digest of a result.
pub fn summarize_rows(result: &ExecutionResult) -> String {
    match result.rows.len() {
        0 => NO_ROWS_SUMMARY.to_string(),
        1 => result
            .columns
            .iter()
            .zip(&result.rows[0])
            .map(|(c, v)| format!("{} = {}", c, cell_text(v)))
            .join(" | "),
        n if result.truncated => format!("{} rows returned (more rows exist).", n),
        n => format!("{} rows returned.", n),
    }
}

pub struct SummarizationStage {
    model: Arc<dyn TextModel>,
    max_tokens: u32,
    timeout: Duration,
}

impl SummarizationStage {
    pub fn new(model: Arc<dyn TextModel>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            model,
            max_tokens,
            timeout,
        }
    }

    pub fn build_prompt(&self, question: &str, sql: &str, result: &ExecutionResult, summary: &str) -> String {
        let preview: Vec<_> = result.records().into_iter().take(PROMPT_ROWS).collect();
        let json_rows = serde_json::to_string(&preview).unwrap_or_default();
        let markdown = render_markdown(&result.columns, &result.rows[..result.rows.len().min(PROMPT_ROWS)]);

        let mut prompt = String::new();
        prompt.push_str("You are an expert data analyst. A SQL query has already been run for the user.\n");
        prompt.push_str("Answer the question in clear, concise plain English based strictly on the rows below.\n");
        prompt.push_str("If there are no rows, say that nothing was found.\n\n");
        prompt.push_str(&format!("QUESTION:\n{}\n\n", question));
        prompt.push_str(&format!("SQL USED:\n{}\n\n", sql));
        prompt.push_str(&format!("RESULT SUMMARY:\n{}\n", summary));
        if result.truncated {
            prompt.push_str(&format!("Only the first {} rows are shown.\n", result.row_count));
        }
        prompt.push_str(&format!("\nRESULT ROWS (JSON):\n{}\n\n", json_rows));
        prompt.push_str(&format!("RESULT TABLE:\n{}\n", markdown));
        prompt
    }

    async fn explain(&self, prompt: &str) -> Result<String> {
        let text = match tokio::time::timeout(self.timeout, self.model.complete(prompt, self.max_tokens)).await {
            Err(_) => {
                return Err(GatewayError::Timeout {
                    stage: Stage::Summarization,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Ok(result) => result?,
        };
        let text = text.trim();
        if text.is_empty() {
            return Err(GatewayError::SummarizationDegraded("model returned an empty answer".to_string()));
        }
        Ok(text.to_string())
    }

    /// Build the answer. Never fails; a model error leaves `explanation`
    /// empty and sets `degraded`.
    pub async fn summarize(&self, question: &str, sql: &str, result: &ExecutionResult) -> Answer {
        let summary = summarize_rows(result);
        let table = TableView::from_result(result);
        let prompt = self.build_prompt(question, sql, result, &summary);

        match self.explain(&prompt).await {
            Ok(explanation) => {
                info!("Summarization produced {} chars", explanation.len());
                Answer {
                    explanation: Some(explanation),
                    table,
                    summary,
                    degraded: None,
                }
            }
            Err(e) => {
                let reason = match e {
                    GatewayError::SummarizationDegraded(reason) => reason,
                    other => other.to_string(),
                };
                warn!("Summarization degraded: {}", reason);
                Answer {
                    explanation: None,
                    table,
                    summary,
                    degraded: Some(reason),
                }
            }
        }
    }
}
