//! Result formatting.
//!
//! Turns raw query results into a natural-language answer.

use crate::error::Result;
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use crate::loader::Row;
use std::sync::Arc;

/// Rows beyond this are summarized, not inlined into the prompt.
const MAX_ROWS_IN_PROMPT: usize = 50;

const FORMAT_RESPONSE_PROMPT: &str = r#"
You are a helpful data assistant. A user asked a question, a SQL query was executed, and you have the raw results. Write a clear, conversational answer.

Database description: {DB_DESCRIPTION}

User question: "{QUESTION}"

Executed SQL:
{SQL}

Query results (JSON rows{TRUNCATION_NOTE}):
{RESULTS}

Guidelines:
- Answer the question directly in the first sentence.
- Mention concrete numbers and names from the results.
- Do not mention SQL, tables, or columns unless the user asked about them.
- If the result set is empty, say that no matching data was found.
- Keep it short: a few sentences, or a compact list when the user asked for a listing.
"#;

pub struct ResponseFormatterAgent {
    llm: Arc<dyn ChatCompletion>,
}

impl ResponseFormatterAgent {
    pub fn new(llm: Arc<dyn ChatCompletion>) -> Self {
        Self { llm }
    }

    pub async fn format_response(
        &self,
        user_query: &str,
        sql_query: &str,
        query_results: &[Row],
        db_description: &str,
    ) -> Result<String> {
        let shown = query_results.len().min(MAX_ROWS_IN_PROMPT);
        let results_json = serde_json::to_string(&query_results[..shown])?;
        let truncation_note = if query_results.len() > shown {
            format!(", first {} of {}", shown, query_results.len())
        } else {
            String::new()
        };

        let prompt = FORMAT_RESPONSE_PROMPT
            .replace("{DB_DESCRIPTION}", db_description)
            .replace("{QUESTION}", user_query)
            .replace("{SQL}", sql_query)
            .replace("{TRUNCATION_NOTE}", &truncation_note)
            .replace("{RESULTS}", &results_json);

        let response = self
            .llm
            .complete(&[ChatMessage::user(prompt)], &CompletionOptions::default())
            .await?;

        Ok(response.trim().to_string())
    }
}
