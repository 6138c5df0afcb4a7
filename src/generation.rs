//! SQL Generation
//!
//! Question + retrieval context -> candidate SQL. The generator is an
//! injectable capability; the default implementation prompts a text model.

use crate::error::{GatewayError, Result};
use crate::llm::TextModel;
use crate::schema_rag::RetrievalContext;
use crate::sql::{parse_query, references};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?is)```[ \t]*(?:sql)?[ \t]*\r?\n?(.*?)```").unwrap();
    static ref SQL_START: Regex = Regex::new(r"(?is)\b(SELECT|WITH)\b.*").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptBudget {
    #[default]
    Normal,
    /// Smaller prompt and token budget, used for the single retry.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct GenerationGuidance {
    pub budget: PromptBudget,
    /// Validation feedback from a rejected attempt.
    pub feedback: Option<String>,
}

impl GenerationGuidance {
    pub fn normal() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            budget: PromptBudget::Strict,
            feedback: None,
        }
    }

    pub fn with_feedback(mut self, feedback: String) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

/// A generated query and what it touches. Tables and columns are lowercase;
/// columns are `table.column` when the owning table is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateQuery {
    pub raw_text: String,
    pub referenced_tables: BTreeSet<String>,
    pub referenced_columns: BTreeSet<String>,
    pub requires_aggregation: bool,
}

impl CandidateQuery {
    /// Analyze SQL text. `requires_aggregation` is set when some block of
    /// the query aggregates or groups. Text that does not parse as a query
    /// keeps empty references; validation rejects it.
    pub fn from_sql(sql: &str) -> Self {
        let found = match parse_query(sql) {
            Ok(query) => references(&query),
            Err(e) => {
                debug!("Candidate SQL does not parse: {}", e);
                Default::default()
            }
        };
        Self {
            raw_text: sql.to_string(),
            referenced_tables: found.tables,
            referenced_columns: found.columns,
            requires_aggregation: found.aggregates,
        }
    }
}

/// Pull the SQL statement out of model output: a fenced block if present,
/// else the text from the first `SELECT`/`WITH`, else the whole text.
/// Trailing semicolons are dropped.
pub fn extract_sql(output: &str) -> Option<String> {
    let body = if let Some(caps) = SQL_FENCE.captures(output) {
        caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string()
    } else {
        let trimmed = output.trim();
        let starts_with_word = trimmed
            .split_whitespace()
            .next()
            .map(|w| {
                let w = w.to_uppercase();
                w.starts_with("SELECT") || w.starts_with("WITH") || w.starts_with('(')
            })
            .unwrap_or(false);
        if starts_with_word {
            trimmed.to_string()
        } else {
            match SQL_START.find(trimmed) {
                Some(m) => m.as_str().to_string(),
                None => trimmed.to_string(),
            }
        }
    };

    let sql = body.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).trim();
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        context: &RetrievalContext,
        guidance: &GenerationGuidance,
    ) -> Result<CandidateQuery>;
}

pub struct LlmSqlGenerator {
    model: Arc<dyn TextModel>,
    max_tokens: u32,
    strict_max_tokens: u32,
    max_columns_per_table: usize,
}

impl LlmSqlGenerator {
    pub fn new(model: Arc<dyn TextModel>, max_tokens: u32, strict_max_tokens: u32, max_columns_per_table: usize) -> Self {
        Self {
            model,
            max_tokens,
            strict_max_tokens,
            max_columns_per_table,
        }
    }

    pub fn build_prompt(&self, question: &str, context: &RetrievalContext, guidance: &GenerationGuidance) -> String {
        let strict = guidance.budget == PromptBudget::Strict;
        let columns = if strict {
            self.max_columns_per_table.min(4)
        } else {
            self.max_columns_per_table
        };

        let mut prompt = String::new();
        prompt.push_str("You translate analytics questions into a single read-only SQL query.\n\n");
        prompt.push_str(&context.prompt_context(columns));
        prompt.push_str("\n\nRules:\n");
        prompt.push_str("- Output exactly one SELECT (or WITH ... SELECT) statement inside a ```sql block.\n");
        prompt.push_str("- Use only the tables and columns listed in the schema.\n");
        if !strict {
            prompt.push_str("- Aggregate with SUM/COUNT/AVG and GROUP BY every non-aggregated column.\n");
            prompt.push_str("- Give aggregated columns readable aliases.\n");
            prompt.push_str("- Never modify data.\n");
        }
        if let Some(feedback) = &guidance.feedback {
            prompt.push_str("\nThe previous query was rejected:\n");
            prompt.push_str(feedback);
            prompt.push_str("\nWrite a corrected query.\n");
        }
        prompt.push_str(&format!("\nQuestion: {}\n", question));
        prompt
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate(
        &self,
        question: &str,
        context: &RetrievalContext,
        guidance: &GenerationGuidance,
    ) -> Result<CandidateQuery> {
        let prompt = self.build_prompt(question, context, guidance);
        let max_tokens = match guidance.budget {
            PromptBudget::Normal => self.max_tokens,
            PromptBudget::Strict => self.strict_max_tokens,
        };

        let output = self
            .model
            .complete(&prompt, max_tokens)
            .await
            .map_err(|e| GatewayError::GenerationFailed(e.to_string()))?;
        debug!("Model output: {}", output);

        let sql = extract_sql(&output).ok_or_else(|| {
            warn!("Model returned no SQL");
            GatewayError::GenerationFailed("model returned no SQL".to_string())
        })?;
        Ok(CandidateQuery::from_sql(&sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedModel {
        output: String,
        prompts: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl TextModel for ScriptedModel {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
            self.prompts.lock().unwrap().push((prompt.to_string(), max_tokens));
            Ok(self.output.clone())
        }
    }

    fn context() -> RetrievalContext {
        RetrievalContext::degraded("q", 1)
    }

    #[test]
    fn test_extract_sql_variants() {
        assert_eq!(
            extract_sql("```sql\nSELECT region FROM sales;\n```").as_deref(),
            Some("SELECT region FROM sales")
        );
        assert_eq!(
            extract_sql("Here you go:\nSELECT 1;;").as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(extract_sql("DROP TABLE t;").as_deref(), Some("DROP TABLE t"));
        assert_eq!(extract_sql("```\n```"), None);
        assert_eq!(extract_sql("   "), None);
    }

    #[test]
    fn test_candidate_references() {
        let q = CandidateQuery::from_sql("SELECT region, SUM(price) FROM International_Sales GROUP BY region");
        assert_eq!(q.referenced_tables.iter().collect::<Vec<_>>(), vec!["international_sales"]);
        assert!(q.referenced_columns.contains("international_sales.region"));
        assert!(q.referenced_columns.contains("international_sales.price"));
        assert!(q.requires_aggregation);
    }

    #[test]
    fn test_aggregation_flag_ignores_question_wording() {
        // "maximum" in the question does not make an ORDER BY ... LIMIT 1 aggregate.
        let q = CandidateQuery::from_sql("SELECT sku FROM international_sales ORDER BY price DESC LIMIT 1");
        assert!(!q.requires_aggregation);

        let q = CandidateQuery::from_sql("DROP TABLE international_sales");
        assert_eq!(q.raw_text, "DROP TABLE international_sales");
        assert!(q.referenced_tables.is_empty());
    }

    #[tokio::test]
    async fn test_generator_uses_strict_budget_and_feedback() {
        let model = Arc::new(ScriptedModel {
            output: "```sql\nSELECT sku FROM sales\n```".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmSqlGenerator::new(model.clone(), 1024, 256, 10);
        let guidance = GenerationGuidance::strict().with_feedback("unknown column 'qty'".to_string());
        let q = generator.generate("list skus", &context(), &guidance).await.unwrap();
        assert_eq!(q.raw_text, "SELECT sku FROM sales");
        assert!(!q.requires_aggregation);

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts[0].1, 256);
        assert!(prompts[0].0.contains("unknown column 'qty'"));
    }

    #[tokio::test]
    async fn test_empty_output_is_generation_failure() {
        let model = Arc::new(ScriptedModel {
            output: "  ".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmSqlGenerator::new(model, 1024, 256, 10);
        let err = generator
            .generate("anything", &context(), &GenerationGuidance::normal())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::GenerationFailed(_)));
    }
}
