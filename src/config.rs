//! Configuration for the text2sql pipeline.

/// Maximum number of questions kept in short-term conversation memory.
pub const SHORT_MEMORY_LENGTH: usize = 5;

/// Delimiter separating streamed JSON event frames.
pub const MESSAGE_DELIMITER: &str = "|||TEXT2SQL_MESSAGE_BOUNDARY|||";

#[derive(Debug, Clone)]
pub struct Config {
    /// Chat completion model identifier.
    pub completion_model: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Base URL of the OpenAI-compatible API.
    pub api_base_url: String,
    pub api_key: String,
    /// Graphs starting with this prefix are shared demo graphs: read-only
    /// for destructive SQL and never deleted or refreshed.
    pub general_prefix: Option<String>,
    /// Maximum healing attempts before giving up on a failed query.
    pub max_healing_attempts: u8,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            completion_model: std::env::var("COMPLETION_MODEL")
                .unwrap_or_else(|_| "gpt-4.1".to_string()),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-ada-002".to_string()),
            api_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| "dummy-api-key".to_string()),
            general_prefix: std::env::var("GENERAL_PREFIX").ok().filter(|p| !p.is_empty()),
            max_healing_attempts: 3,
        }
    }

    pub fn is_demo_graph(&self, graph_id: &str) -> bool {
        self.general_prefix
            .as_deref()
            .map(|prefix| graph_id.starts_with(prefix))
            .unwrap_or(false)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            completion_model: "gpt-4.1".to_string(),
            embedding_model: "text-embedding-ada-002".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: "dummy-api-key".to_string(),
            general_prefix: None,
            max_healing_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_has_sane_defaults() {
        let config = Config::from_env();
        assert_eq!(config.max_healing_attempts, 3);
        assert!(!config.completion_model.is_empty());
        assert!(!config.embedding_model.is_empty());
    }

    #[test]
    fn test_demo_graph_detection() {
        let mut config = Config::default();
        assert!(!config.is_demo_graph("demo_movies"));

        config.general_prefix = Some("demo_".to_string());
        assert!(config.is_demo_graph("demo_movies"));
        assert!(!config.is_demo_graph("alice_movies"));
    }
}
