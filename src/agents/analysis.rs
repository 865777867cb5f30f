//! SQL analysis engine.
//!
//! One LLM call per turn that either translates the question into a single
//! SQL statement or refuses with missing-information and ambiguity lists
//! and a confidence score.

use crate::agents::parser::parse_llm_json;
use crate::error::{Result, Text2SqlError};
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use crate::loader::DatabaseType;
use crate::pipeline::history::ConversationHistory;
use crate::schema_rag::TableDescriptor;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Structured verdict of one analysis call. Immutable once returned, except
/// that the healer overwrites `sql_query` after a successful repair.
#[derive(Debug, Clone)]
pub struct AnalysisVerdict {
    pub is_sql_translatable: bool,
    /// Exactly one statement when translatable; empty string otherwise.
    pub sql_query: String,
    /// 0–100.
    pub confidence: i64,
    /// Hyphen-bulleted, flattened from the model's list form.
    pub missing_information: String,
    /// Hyphen-bulleted, flattened from the model's list form.
    pub ambiguities: String,
    pub explanation: String,
    pub instructions_comments: String,
    pub tables_used: Vec<String>,
    /// Raw model text, kept only when parsing failed (diagnostics).
    pub raw_response: Option<String>,
}

/// Wire shape of the model's JSON. Lists and strings are both accepted for
/// the ambiguity/missing fields; numbers may arrive as floats.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    is_sql_translatable: bool,
    #[serde(default)]
    sql_query: String,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    missing_information: Value,
    #[serde(default)]
    ambiguities: Value,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    instructions_comments: String,
    #[serde(default)]
    tables_used: Vec<String>,
}

/// Flatten a list-valued field into the single hyphen-bulleted string the
/// downstream event format expects. String values pass through unchanged.
fn flatten_list_field(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let cleaned: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_str())
                .map(|item| item.replace('-', " "))
                .collect();
            if cleaned.is_empty() {
                String::new()
            } else {
                format!("- {}", cleaned.join("- "))
            }
        }
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn clamp_confidence(value: &Value) -> i64 {
    let confidence = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0).round() as i64,
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    confidence.clamp(0, 100)
}

impl AnalysisVerdict {
    fn from_raw(raw: RawVerdict) -> Self {
        let mut verdict = Self {
            is_sql_translatable: raw.is_sql_translatable,
            sql_query: raw.sql_query.trim().to_string(),
            confidence: clamp_confidence(&raw.confidence),
            missing_information: flatten_list_field(&raw.missing_information),
            ambiguities: flatten_list_field(&raw.ambiguities),
            explanation: raw.explanation,
            instructions_comments: raw.instructions_comments,
            tables_used: raw.tables_used,
            raw_response: None,
        };

        // Enforce the verdict invariant at construction instead of trusting
        // the model: translatable ⇔ non-empty SQL.
        if verdict.is_sql_translatable && verdict.sql_query.is_empty() {
            warn!("Model claimed translatable but returned no SQL; downgrading verdict");
            verdict.is_sql_translatable = false;
            verdict.confidence = 0;
            if verdict.explanation.is_empty() {
                verdict.explanation = "Model returned no SQL statement".to_string();
            }
        }
        if !verdict.is_sql_translatable {
            verdict.sql_query = String::new();
        }

        verdict
    }

    /// Fallback verdict for unparseable model output: never crashes the
    /// pipeline, keeps the raw text for diagnostics.
    pub fn parse_fallback(raw_response: &str, parse_error: &str) -> Self {
        Self {
            is_sql_translatable: false,
            sql_query: String::new(),
            confidence: 0,
            missing_information: String::new(),
            ambiguities: String::new(),
            explanation: format!("Failed to parse response: {}", parse_error),
            instructions_comments: String::new(),
            tables_used: Vec::new(),
            raw_response: Some(raw_response.to_string()),
        }
    }
}

pub struct AnalysisAgent {
    llm: Arc<dyn ChatCompletion>,
    messages: Vec<ChatMessage>,
    dialect_injected: bool,
}

impl AnalysisAgent {
    pub fn new(llm: Arc<dyn ChatCompletion>, history: &ConversationHistory) -> Self {
        Self {
            llm,
            messages: history.message_buffer(),
            dialect_injected: false,
        }
    }

    /// Analyze the question against the retrieved schema and produce a
    /// verdict. Parse failures degrade to a confidence-0 fallback verdict.
    #[allow(clippy::too_many_arguments)]
    pub async fn analyze(
        &mut self,
        user_query: &str,
        schema: &[TableDescriptor],
        db_description: &str,
        instructions: Option<&str>,
        memory_context: Option<&str>,
        database_type: Option<DatabaseType>,
    ) -> Result<AnalysisVerdict> {
        // The dialect system message goes in exactly once, as the first
        // message, the first time the buffer is used for this session.
        if !self.dialect_injected {
            if let Some(db_type) = database_type {
                self.messages.insert(
                    0,
                    ChatMessage::system(format!(
                        "The target database dialect is {}. Generate SQL for this dialect only.",
                        db_type.as_str()
                    )),
                );
            }
            self.dialect_injected = true;
        }

        let formatted_schema = format_schema(schema);
        let prompt = build_analysis_prompt(
            user_query,
            &formatted_schema,
            db_description,
            instructions.unwrap_or(""),
            memory_context.unwrap_or(""),
            &self.messages,
        );

        self.messages.push(ChatMessage::user(prompt));

        let response = self
            .llm
            .complete(&self.messages, &CompletionOptions::default())
            .await?;

        let verdict = match parse_llm_json::<RawVerdict>(&response) {
            Ok(raw) => AnalysisVerdict::from_raw(raw),
            Err(Text2SqlError::LlmParse(e)) => {
                warn!("Analysis response was not valid JSON: {}", e);
                AnalysisVerdict::parse_fallback(&response, &e)
            }
            Err(other) => return Err(other),
        };

        self.messages.push(ChatMessage::assistant(verdict.sql_query.clone()));
        Ok(verdict)
    }
}

/// Render the retrieved descriptors into the schema block of the prompt.
fn format_schema(schema: &[TableDescriptor]) -> String {
    let mut formatted = Vec::with_capacity(schema.len());

    for table in schema {
        let mut table_str = format!("Table: {} - {}\n", table.name, table.description);

        for column in &table.columns {
            let key_info = match column.key_type.as_deref() {
                Some("PRI") => ", PRIMARY KEY",
                Some("FK") => ", FOREIGN KEY",
                _ => "",
            };
            table_str.push_str(&format!(
                "  - {} ({}{},{},{}): {}\n",
                column.name,
                column.data_type.as_deref().unwrap_or("unknown"),
                key_info,
                column.key_type.as_deref().unwrap_or(""),
                column.nullable,
                column.description,
            ));
        }

        table_str.push_str(&format!("  {}\n", table.foreign_keys));
        formatted.push(table_str);
    }

    formatted.join("\n")
}

fn build_analysis_prompt(
    user_input: &str,
    formatted_schema: &str,
    db_description: &str,
    instructions: &str,
    memory_context: &str,
    conversation: &[ChatMessage],
) -> String {
    let conversation_history: Vec<String> = conversation
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect();

    format!(
        r#"
You must strictly follow the instructions below. Deviations will result in a penalty to your confidence score.

MANDATORY RULES:
- Always explain if you cannot fully follow the instructions.
- Always reduce the confidence score if instructions cannot be fully applied.
- Never skip explaining missing information, ambiguities, or instruction issues.
- Respond ONLY in strict JSON format, without extra text.
- If the query relates to a previous question, you MUST take into account the previous question and its answer, and answer based on the context and information provided so far.
- Produce exactly ONE SQL statement when the query is translatable, never several.
- When counting rows, count an explicit key column (e.g. COUNT(id)), not COUNT(*).
- Personalized queries (first-person possessive such as "my orders") are translatable ONLY if a user identifier is resolvable from the memory context or the schema. If it is not, set is_sql_translatable to false, add "User identification required for personal query" to missing_information, and do NOT invent a placeholder identifier.
- Only create JOINs between tables that are explicitly connected by a foreign key in the input schema.

If the user is asking a follow-up or continuing question, use the conversation history and previous answers to resolve references, context, or ambiguities. Always base your analysis on the cumulative context, not just the current question.

Your output JSON MUST contain all fields, even if empty (e.g., "missing_information": []).

---

Now analyze the user query based on the provided inputs:

<database_description>
{db_description}
</database_description>

<instructions>
{instructions}
</instructions>

<memory_context>
{memory_context}
</memory_context>

<database_schema>
{formatted_schema}
</database_schema>

<conversation_history>
{conversation_history}
</conversation_history>

<user_query>
{user_input}
</user_query>

---

Provide your output ONLY in the following JSON structure:

{{
    "is_sql_translatable": true or false,
    "instructions_comments": "Comments about any part of the instructions, especially if they are unclear, impossible, or partially met",
    "explanation": "Detailed explanation why the query can or cannot be translated",
    "sql_query": "The SQL query (empty string when not translatable)",
    "tables_used": ["tables", "used", "in", "the", "query"],
    "missing_information": ["list", "of", "missing", "information"],
    "ambiguities": ["list", "of", "ambiguities"],
    "confidence": integer between 0 and 100
}}

Again: OUTPUT ONLY VALID JSON. No explanations outside the JSON block."#,
        db_description = db_description,
        instructions = instructions,
        memory_context = memory_context,
        formatted_schema = formatted_schema,
        conversation_history = conversation_history.join("\n"),
        user_input = user_input,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_rag::ColumnDescriptor;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingLlm {
        response: String,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl RecordingLlm {
        fn new(response: &str) -> Self {
            Self { response: response.to_string(), calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ChatCompletion for RecordingLlm {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String> {
            self.calls.lock().unwrap().push(messages.to_vec());
            Ok(self.response.clone())
        }
    }

    fn users_table() -> TableDescriptor {
        TableDescriptor {
            name: "users".to_string(),
            description: "registered users".to_string(),
            foreign_keys: "Foreign keys: {}".to_string(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".to_string(),
                    description: "primary key".to_string(),
                    data_type: Some("integer".to_string()),
                    key_type: Some("PRI".to_string()),
                    nullable: false,
                },
                ColumnDescriptor {
                    name: "name".to_string(),
                    description: "display name".to_string(),
                    data_type: Some("text".to_string()),
                    key_type: None,
                    nullable: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_translatable_verdict() {
        let llm = Arc::new(RecordingLlm::new(
            r#"{"is_sql_translatable": true, "sql_query": "SELECT COUNT(id) FROM users",
                "confidence": 95, "missing_information": [], "ambiguities": [],
                "explanation": "simple count", "tables_used": ["users"]}"#,
        ));
        let mut agent = AnalysisAgent::new(llm, &ConversationHistory::default());
        let verdict = agent
            .analyze("How many users are there?", &[users_table()], "crm", None, None, None)
            .await
            .unwrap();
        assert!(verdict.is_sql_translatable);
        assert_eq!(verdict.sql_query, "SELECT COUNT(id) FROM users");
        assert!(verdict.confidence > 0);
    }

    #[tokio::test]
    async fn test_verdict_invariant_not_translatable_means_empty_sql() {
        let llm = Arc::new(RecordingLlm::new(
            r#"{"is_sql_translatable": false, "sql_query": "SELECT 1",
                "confidence": 10, "missing_information": ["User identification required for personal query"],
                "ambiguities": [], "explanation": "no identity"}"#,
        ));
        let mut agent = AnalysisAgent::new(llm, &ConversationHistory::default());
        let verdict = agent
            .analyze("Show my orders", &[], "crm", None, None, None)
            .await
            .unwrap();
        assert!(!verdict.is_sql_translatable);
        assert_eq!(verdict.sql_query, "");
        assert!(verdict
            .missing_information
            .contains("User identification required for personal query"));
    }

    #[tokio::test]
    async fn test_verdict_invariant_translatable_with_empty_sql_downgraded() {
        let llm = Arc::new(RecordingLlm::new(
            r#"{"is_sql_translatable": true, "sql_query": "", "confidence": 80}"#,
        ));
        let mut agent = AnalysisAgent::new(llm, &ConversationHistory::default());
        let verdict = agent.analyze("q", &[], "db", None, None, None).await.unwrap();
        assert!(!verdict.is_sql_translatable);
        assert_eq!(verdict.confidence, 0);
    }

    #[tokio::test]
    async fn test_list_fields_flattened_to_bulleted_strings() {
        let llm = Arc::new(RecordingLlm::new(
            r#"{"is_sql_translatable": false, "sql_query": "", "confidence": 20,
                "missing_information": ["start-date", "end-date"],
                "ambiguities": ["which region"], "explanation": "unclear"}"#,
        ));
        let mut agent = AnalysisAgent::new(llm, &ConversationHistory::default());
        let verdict = agent.analyze("q", &[], "db", None, None, None).await.unwrap();
        assert_eq!(verdict.missing_information, "- start date- end date");
        assert_eq!(verdict.ambiguities, "- which region");
    }

    #[tokio::test]
    async fn test_parse_failure_falls_back_with_raw_preserved() {
        let llm = Arc::new(RecordingLlm::new("I will not answer in JSON today"));
        let mut agent = AnalysisAgent::new(llm, &ConversationHistory::default());
        let verdict = agent.analyze("q", &[], "db", None, None, None).await.unwrap();
        assert!(!verdict.is_sql_translatable);
        assert_eq!(verdict.confidence, 0);
        assert_eq!(
            verdict.raw_response.as_deref(),
            Some("I will not answer in JSON today")
        );
    }

    #[tokio::test]
    async fn test_dialect_injected_once_as_first_message() {
        let llm = Arc::new(RecordingLlm::new(
            r#"{"is_sql_translatable": true, "sql_query": "SELECT COUNT(id) FROM users", "confidence": 90}"#,
        ));
        let mut agent = AnalysisAgent::new(Arc::clone(&llm) as Arc<dyn ChatCompletion>,
            &ConversationHistory::default());

        agent
            .analyze("q1", &[], "db", None, None, Some(DatabaseType::Sqlite))
            .await
            .unwrap();
        agent
            .analyze("q2", &[], "db", None, None, Some(DatabaseType::Sqlite))
            .await
            .unwrap();

        let calls = llm.calls.lock().unwrap();
        // First message of both calls is the single injected dialect message.
        for call in calls.iter() {
            assert_eq!(call[0].role, "system");
            assert!(call[0].content.contains("sqlite"));
        }
        let system_count = calls[1].iter().filter(|m| m.role == "system").count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn test_format_schema_marks_keys() {
        let formatted = format_schema(&[users_table()]);
        assert!(formatted.contains("Table: users - registered users"));
        assert!(formatted.contains("PRIMARY KEY"));
        assert!(formatted.contains("Foreign keys: {}"));
    }

    #[test]
    fn test_flatten_list_field_shapes() {
        assert_eq!(flatten_list_field(&serde_json::json!(["a", "b"])), "- a- b");
        assert_eq!(flatten_list_field(&serde_json::json!("already flat")), "already flat");
        assert_eq!(flatten_list_field(&serde_json::json!([])), "");
        assert_eq!(flatten_list_field(&serde_json::json!(null)), "");
    }
}
