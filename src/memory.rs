//! Long-term memory seam.
//!
//! The memory engine (graph summarization, episodic recall) is an external
//! collaborator. Every call is best-effort: the pipeline logs failures and
//! moves on, and background persistence never blocks or fails a response.

use crate::error::Result;
use crate::pipeline::history::ConversationHistory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one conversation turn, persisted after the response stream
/// has already been sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub question: String,
    pub generated_sql: String,
    pub answer: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(question: String, generated_sql: String, answer: String, error: Option<String>) -> Self {
        Self {
            question,
            generated_sql,
            answer,
            success: error.is_none(),
            error,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Retrieve memory context relevant to a query, as free text for
    /// prompt injection. Empty string when nothing is known.
    async fn search_memories(&self, query: &str) -> Result<String>;

    /// Record one query outcome.
    async fn save_query_memory(
        &self,
        query: &str,
        sql_query: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<bool>;

    /// Record a conversation-turn summary with its surrounding history.
    async fn add_new_memory(&self, turn: &TurnRecord, history: &ConversationHistory)
        -> Result<bool>;

    /// Periodic cleanup of stale memories.
    async fn clean_memory(&self) -> Result<()>;
}

/// No-op memory store for deployments without a memory backend.
pub struct NullMemoryStore;

#[async_trait]
impl MemoryStore for NullMemoryStore {
    async fn search_memories(&self, _query: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn save_query_memory(
        &self,
        _query: &str,
        _sql_query: &str,
        _success: bool,
        _error: Option<&str>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn add_new_memory(
        &self,
        _turn: &TurnRecord,
        _history: &ConversationHistory,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn clean_memory(&self) -> Result<()> {
        Ok(())
    }
}
