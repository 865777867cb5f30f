//! Chat completion client.
//!
//! Thin wrapper over an OpenAI-compatible chat completions API. Components
//! receive the provider as `Arc<dyn ChatCompletion>` so tests can substitute
//! scripted fakes.

use crate::error::{Result, Text2SqlError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Per-call completion parameters.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// When set, the request asks the API for a JSON object response.
    pub json_response: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { temperature: 0.0, max_tokens: None, json_response: false }
    }
}

impl CompletionOptions {
    pub fn with_temperature(temperature: f32) -> Self {
        Self { temperature, ..Default::default() }
    }
}

/// Chat completion provider seam.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions)
        -> Result<String>;
}

/// Completion client for OpenAI-compatible APIs.
#[derive(Clone)]
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
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
impl ChatCompletion for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
        });

        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if options.json_response {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Text2SqlError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Text2SqlError::Llm(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Text2SqlError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(Text2SqlError::Llm(format!(
                "LLM API error: {}",
                serde_json::to_string(error).unwrap_or_else(|_| "Unknown error".to_string())
            )));
        }

        let choices = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Text2SqlError::Llm("No choices in LLM response".to_string()))?;

        if let Some(finish_reason) = choices[0].get("finish_reason").and_then(|r| r.as_str()) {
            if finish_reason == "length" {
                warn!("LLM response was truncated due to length limit");
            } else if finish_reason == "content_filter" {
                return Err(Text2SqlError::Llm(
                    "LLM response was filtered by content policy".to_string(),
                ));
            }
        }

        let content = choices[0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Text2SqlError::Llm("No content in LLM response".to_string()))?;

        if content.is_empty() {
            return Err(Text2SqlError::Llm("Empty content in LLM response".to_string()));
        }

        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::system("dialect is postgresql");
        assert_eq!(msg.role, "system");
        let msg = ChatMessage::assistant("SELECT 1");
        assert_eq!(msg.role, "assistant");
    }

    #[test]
    fn test_default_options_are_deterministic() {
        let options = CompletionOptions::default();
        assert_eq!(options.temperature, 0.0);
        assert!(options.max_tokens.is_none());
    }
}
