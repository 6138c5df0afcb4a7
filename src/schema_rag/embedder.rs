//! Schema Embedder
//!
//! Turns descriptor documents and questions into vectors, either through the
//! OpenAI embeddings API or a deterministic local hashing model.

use crate::config::{EmbeddingConfig, EmbeddingProvider, LlmConfig};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Embedding>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Build the embedder selected in the configuration.
pub fn embedder_from_config(embedding: &EmbeddingConfig, llm: &LlmConfig) -> Result<Arc<dyn Embedder>> {
    match embedding.provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(embedding.dimension))),
        EmbeddingProvider::OpenAi => {
            let api_key = llm.api_key.clone().ok_or_else(|| {
                GatewayError::Config("EMBEDDING_PROVIDER=openai requires OPENAI_API_KEY".to_string())
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                llm.openai_base_url.clone(),
                embedding.model.clone(),
                embedding.dimension,
            )))
        }
    }
}

/// Embedding client using OpenAI API
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
            dimension,
        }
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<Embedding>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "dimensions": self.dimension,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| GatewayError::Embedding("No embedding data in response".to_string()))?;

        // Results carry their input position; order by it rather than trusting
        // the array order.
        let mut indexed: Vec<(u64, Embedding)> = Vec::with_capacity(data.len());
        for (pos, item) in data.iter().enumerate() {
            let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(pos as u64);
            let embedding: Embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| GatewayError::Embedding("No embedding vector in response".to_string()))?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if embedding.len() != self.dimension {
                return Err(GatewayError::Embedding(format!(
                    "Embedding dimension {} doesn't match configured dimension {}",
                    embedding.len(),
                    self.dimension
                )));
            }
            indexed.push((index, embedding));
        }
        indexed.sort_by_key(|(i, _)| *i);
        Ok(indexed.into_iter().map(|(_, e)| e).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.request(serde_json::json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Embedding("Empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.request(serde_json::json!(texts)).await?;
        if embeddings.len() != texts.len() {
            return Err(GatewayError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "by", "for", "in", "is", "me", "of", "on", "per", "show", "the", "to",
    "what", "which", "with",
];

/// Deterministic feature-hashing embedder.
///
/// Each word and each character trigram of a word lands in a signed bucket;
/// the vector is L2-normalized. Words sharing a prefix (`intl` /
/// `international`) share trigrams and therefore score above unrelated words.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && !STOP_WORDS.contains(w));

        for w in words {
            self.add_feature(&mut vector, w.as_bytes(), 1.0);
            let padded: Vec<char> = format!("^{}$", w).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, gram.as_bytes(), 0.5);
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_text(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_rag::vector_store::cosine_similarity;

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("total sales by region").await.unwrap();
        let b = embedder.embed("total sales by region").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_related_text_scores_higher() {
        let embedder = HashingEmbedder::new(256);
        let question = embedder.embed("total sales by region").await.unwrap();
        let region = embedder
            .embed("table: international_sales; column: region; type: str")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("table: warehouses; column: capacity_m3; type: i64")
            .await
            .unwrap();
        assert!(cosine_similarity(&question, &region) > cosine_similarity(&question, &unrelated));
    }

    #[tokio::test]
    async fn test_empty_text_yields_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        let v = embedder.embed("  ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        let batch = embedder
            .embed_batch(&["a b".to_string(), "region".to_string()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }
}
