use crate::config::{LlmConfig, LlmProvider};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// A text completion backend.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Provider and model, for logs.
    fn describe(&self) -> String;

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
}

const SYSTEM_PROMPT: &str =
    "You are a precise data analyst. Follow the output format requested in the prompt exactly.";

pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn call_openai(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Llm("OPENAI_API_KEY is not set".to_string()))?;

        let body = serde_json::json!({
            "model": self.config.openai_model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.config.temperature,
            "max_tokens": max_tokens
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.openai_base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(usage) = response_json.get("usage") {
            info!(
                "Token usage: prompt={}, completion={}, total={}",
                usage["prompt_tokens"], usage["completion_tokens"], usage["total_tokens"]
            );
        }

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::Llm("No content in LLM response".to_string()))?;

        Ok(content.trim().to_string())
    }

    async fn call_ollama(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.ollama_model,
            "system": SYSTEM_PROMPT,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.config.temperature,
                "num_predict": max_tokens
            }
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.config.ollama_base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("Ollama call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Llm(format!("Ollama error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Llm(format!("Failed to parse Ollama response: {}", e)))?;

        let content = response_json["response"]
            .as_str()
            .ok_or_else(|| GatewayError::Llm("No content in Ollama response".to_string()))?;

        Ok(content.trim().to_string())
    }
}

#[async_trait]
impl TextModel for LlmClient {
    fn describe(&self) -> String {
        format!("{:?}/{}", self.config.provider, self.config.model_name())
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        debug!("Calling {} ({} prompt chars)", self.describe(), prompt.len());
        match self.config.provider {
            LlmProvider::OpenAi => self.call_openai(prompt, max_tokens).await,
            LlmProvider::Ollama => self.call_ollama(prompt, max_tokens).await,
            LlmProvider::Offline => Err(GatewayError::Llm(
                "No language model configured (LLM_PROVIDER=offline)".to_string(),
            )),
        }
    }
}
