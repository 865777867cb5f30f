use thiserror::Error;

#[derive(Error, Debug)]
pub enum Text2SqlError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Text2SqlError {
    /// Message safe to surface to the end user. Backend details stay in
    /// the logs.
    pub fn user_message(&self) -> String {
        match self {
            Text2SqlError::InvalidArgument(msg) => msg.clone(),
            Text2SqlError::GraphNotFound(_) => "Graph not found".to_string(),
            Text2SqlError::QueryExecution(_) => "Error executing SQL query".to_string(),
            Text2SqlError::Cancelled(_) => "Operation cancelled".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Text2SqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_internals() {
        let err = Text2SqlError::Internal("connection pool exhausted at 10.0.0.3".to_string());
        assert_eq!(err.user_message(), "Internal server error");

        let err = Text2SqlError::QueryExecution("no such column: yr".to_string());
        assert_eq!(err.user_message(), "Error executing SQL query");
    }

    #[test]
    fn test_user_message_keeps_argument_errors() {
        let err = Text2SqlError::InvalidArgument("Empty chat history".to_string());
        assert_eq!(err.user_message(), "Empty chat history");
    }
}
