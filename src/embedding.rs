//! Embedding provider.
//!
//! Batch text embedding over an OpenAI-compatible embeddings API.

use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;

pub type Embedding = Vec<f32>;

/// Embedding provider seam. A missing or failing provider is a
/// configuration error and propagates; retrieval never silently degrades
/// on embedding failure.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Dimensionality of the vectors produced by this provider.
    async fn vector_size(&self) -> Result<usize>;
}

pub struct OpenAiEmbedder {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            api_key,
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Text2SqlError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Text2SqlError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Text2SqlError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        let data = response_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Text2SqlError::Embedding("No embedding data in response".to_string()))?;

        let mut embeddings = Vec::with_capacity(data.len());
        for item in data {
            let vector: Vec<f32> = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    Text2SqlError::Embedding("No embedding vector in response".to_string())
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(vector);
        }

        if embeddings.len() != texts.len() {
            return Err(Text2SqlError::Embedding(format!(
                "Embedding count mismatch: requested {}, received {}",
                texts.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }

    async fn vector_size(&self) -> Result<usize> {
        let probe = self.embed(&["Hello World".to_string()]).await?;
        probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| Text2SqlError::Embedding("Empty embedding probe".to_string()))
    }
}
