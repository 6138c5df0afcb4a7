//! Gateway configuration
//!
//! One explicit struct handed to the pipeline at construction. Values come from
//! defaults, an optional JSON file, then environment variables (`.env` is
//! loaded by the binaries through `dotenv`).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
    /// No model configured: generation fails, summaries degrade.
    Offline,
}

impl FromStr for LlmProvider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "ollama" => Ok(LlmProvider::Ollama),
            "offline" | "none" => Ok(LlmProvider::Offline),
            other => Err(GatewayError::Config(format!(
                "Invalid LLM provider: {}. Must be: openai | ollama | offline",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    OpenAi,
    /// Deterministic local feature hashing, no network.
    Hashing,
}

impl FromStr for EmbeddingProvider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(EmbeddingProvider::OpenAi),
            "hashing" | "local" => Ok(EmbeddingProvider::Hashing),
            other => Err(GatewayError::Config(format!(
                "Invalid embedding provider: {}. Must be: openai | hashing",
                other
            ))),
        }
    }
}

/// What the controller does when retrieval is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalFallback {
    /// Continue with an empty context explicitly flagged as degraded.
    Degraded,
    /// Terminate the request.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Token budget for the single retry after a failed generation.
    pub strict_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Offline,
            api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4.1-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            strict_max_tokens: 512,
        }
    }
}

impl LlmConfig {
    pub fn model_name(&self) -> &str {
        match self.provider {
            LlmProvider::OpenAi => &self.openai_model,
            LlmProvider::Ollama => &self.ollama_model,
            LlmProvider::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            model: "text-embedding-3-small".to_string(),
            dimension: 768,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_columns_per_table: usize,
    pub fallback: RetrievalFallback,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            max_columns_per_table: 10,
            fallback: RetrievalFallback::Degraded,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Minimum name similarity (0.0-1.0) for a closest-match rename.
    pub rename_threshold: f64,
    /// Whether a rejected query may be regenerated once with feedback.
    pub allow_regeneration: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            rename_threshold: 0.80,
            allow_regeneration: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub row_ceiling: usize,
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            row_ceiling: 100,
            timeout_ms: 30_000,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Bounds for the external calls other than execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub summarization_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            retrieval_ms: 10_000,
            generation_ms: 60_000,
            summarization_ms: 30_000,
        }
    }
}

impl StageTimeouts {
    pub fn retrieval(&self) -> Duration {
        Duration::from_millis(self.retrieval_ms)
    }

    pub fn generation(&self) -> Duration {
        Duration::from_millis(self.generation_ms)
    }

    pub fn summarization(&self) -> Duration {
        Duration::from_millis(self.summarization_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub validation: ValidationConfig,
    pub execution: ExecutionConfig,
    pub timeouts: StageTimeouts,
    /// Directory of `.csv` / `.parquet` tables served by the engine.
    pub data_dir: PathBuf,
    /// Optional directory of `<table>_metadata.json` descriptor files.
    pub metadata_dir: Option<PathBuf>,
    /// SQLite file for the query history; disabled when unset.
    pub history_path: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            validation: ValidationConfig::default(),
            execution: ExecutionConfig::default(),
            timeouts: StageTimeouts::default(),
            data_dir: PathBuf::from("data"),
            metadata_dir: None,
            history_path: None,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Split out from `from_env` so tests
    /// can feed a map instead of mutating the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LLM_PROVIDER") {
            self.llm.provider = v.parse()?;
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            if !v.trim().is_empty() {
                self.llm.api_key = Some(v);
                if lookup("LLM_PROVIDER").is_none() {
                    self.llm.provider = LlmProvider::OpenAi;
                }
            }
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            self.llm.openai_base_url = v;
        }
        if let Some(v) = lookup("OPENAI_MODEL") {
            self.llm.openai_model = v;
        }
        if let Some(v) = lookup("OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = v;
        }
        if let Some(v) = lookup("OLLAMA_MODEL") {
            self.llm.ollama_model = v;
        }
        if let Some(v) = lookup("LLM_TEMPERATURE") {
            self.llm.temperature = parse_number("LLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_number("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = v.parse()?;
        }
        if let Some(v) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = lookup("VECTOR_DIM") {
            self.embedding.dimension = parse_number("VECTOR_DIM", &v)?;
        }
        if let Some(v) = lookup("RETRIEVAL_TOP_K") {
            self.retrieval.top_k = parse_number("RETRIEVAL_TOP_K", &v)?;
        }
        if let Some(v) = lookup("RETRIEVAL_FALLBACK") {
            self.retrieval.fallback = match v.trim().to_lowercase().as_str() {
                "degraded" => RetrievalFallback::Degraded,
                "fail" => RetrievalFallback::Fail,
                other => {
                    return Err(GatewayError::Config(format!(
                        "Invalid RETRIEVAL_FALLBACK: {}. Must be: degraded | fail",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("RENAME_THRESHOLD") {
            self.validation.rename_threshold = parse_number("RENAME_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MAX_RESULT_ROWS") {
            self.execution.row_ceiling = parse_number("MAX_RESULT_ROWS", &v)?;
        }
        if let Some(v) = lookup("EXECUTION_TIMEOUT_MS") {
            self.execution.timeout_ms = parse_number("EXECUTION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("METADATA_DIR") {
            self.metadata_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HISTORY_PATH") {
            self.history_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("BIND_ADDR") {
            self.bind_addr = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(GatewayError::Config("retrieval.top_k must be at least 1".to_string()));
        }
        if self.execution.row_ceiling == 0 {
            return Err(GatewayError::Config(
                "execution.row_ceiling must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.validation.rename_threshold) {
            return Err(GatewayError::Config(format!(
                "validation.rename_threshold must be within 0.0..=1.0, got {}",
                self.validation.rename_threshold
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(GatewayError::Config("embedding.dimension must be positive".to_string()));
        }
        if self.llm.provider == LlmProvider::OpenAi && self.llm.api_key.is_none() {
            return Err(GatewayError::Config(
                "LLM_PROVIDER=openai requires OPENAI_API_KEY".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| GatewayError::Config(format!("{} is not a valid number: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.row_ceiling, 100);
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.llm.provider, LlmProvider::Offline);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = GatewayConfig::default();
        config
            .apply_env(lookup_from(&[
                ("MAX_RESULT_ROWS", "25"),
                ("RETRIEVAL_TOP_K", "12"),
                ("RENAME_THRESHOLD", "0.9"),
                ("RETRIEVAL_FALLBACK", "fail"),
            ]))
            .unwrap();
        assert_eq!(config.execution.row_ceiling, 25);
        assert_eq!(config.retrieval.top_k, 12);
        assert_eq!(config.retrieval.fallback, RetrievalFallback::Fail);
        assert!((config.validation.rename_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_api_key_selects_openai() {
        let mut config = GatewayConfig::default();
        config.apply_env(lookup_from(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
        assert_eq!(config.llm.model_name(), "gpt-4.1-mini");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = GatewayConfig::default();
        assert!(config.apply_env(lookup_from(&[("LLM_PROVIDER", "gemini")])).is_err());

        let mut config = GatewayConfig::default();
        assert!(config.apply_env(lookup_from(&[("MAX_RESULT_ROWS", "0")])).is_err());

        let mut config = GatewayConfig::default();
        assert!(config.apply_env(lookup_from(&[("LLM_PROVIDER", "openai")])).is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"execution": {"row_ceiling": 10}}"#).unwrap();
        assert_eq!(config.execution.row_ceiling, 10);
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.retrieval.top_k, 8);
    }
}
