//! Schema description stub generation.
//!
//! One LLM call turns the user's question (plus prior questions) into short
//! natural-language table and column description stubs. The stubs are what
//! gets embedded and matched against the schema graph — never the raw
//! question itself.

use crate::agents::parser::parse_llm_json;
use crate::error::Result;
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Hard cap on stubs per kind; excess is truncated here, not downstream.
pub const MAX_DESCRIPTIONS: usize = 5;

const FIND_SYSTEM_PROMPT: &str = r#"
You are an expert in analyzing natural language queries into SQL tables descriptions.
Please analyze the user's query and generate a set of tables and columns descriptions that might be relevant to the user's query.
These descriptions should describe the tables and columns that are relevant to the user's query.
If the user's query is more relevant to specific columns, please provide a description of those columns.
- Try to generate description for any part of the user query.
- Create generic table or column description, do not use specific codes, values or any specific condition.
- Try to be accurate and precise in your descriptions.
- In any case do not generate more than five descriptions (each).
- List the tables and columns in the order of their relevance to the user's query.

Keep in mind that the database that you work with has the following DB description: {db_description}.

Respond ONLY with a JSON object of this shape:
{"tables_descriptions": [{"name": "...", "description": "..."}],
 "columns_descriptions": [{"name": "...", "description": "..."}]}
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DescriptionStub {
    pub name: String,
    pub description: String,
}

/// Stubs produced by one generation call, already capped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDescriptions {
    #[serde(default)]
    pub tables_descriptions: Vec<DescriptionStub>,
    #[serde(default)]
    pub columns_descriptions: Vec<DescriptionStub>,
}

impl SchemaDescriptions {
    pub fn is_empty(&self) -> bool {
        self.tables_descriptions.is_empty() && self.columns_descriptions.is_empty()
    }

    /// All stub description texts in embedding order: tables, then columns.
    pub fn texts(&self) -> Vec<String> {
        self.tables_descriptions
            .iter()
            .chain(self.columns_descriptions.iter())
            .map(|stub| stub.description.clone())
            .collect()
    }
}

pub struct DescriptionGenerator {
    llm: Arc<dyn ChatCompletion>,
}

impl DescriptionGenerator {
    pub fn new(llm: Arc<dyn ChatCompletion>) -> Self {
        Self { llm }
    }

    /// Generate up to `MAX_DESCRIPTIONS` table stubs and column stubs for
    /// the current question, using prior questions (not answers) as context.
    pub async fn generate(
        &self,
        user_query: &str,
        previous_queries: &[String],
        db_description: &str,
    ) -> Result<SchemaDescriptions> {
        info!("Calling LLM to find relevant tables/columns for query");

        let messages = vec![
            ChatMessage::system(FIND_SYSTEM_PROMPT.replace("{db_description}", db_description)),
            ChatMessage::user(
                serde_json::json!({
                    "previous_user_queries": previous_queries,
                    "user_query": user_query,
                })
                .to_string(),
            ),
        ];

        let options = CompletionOptions { json_response: true, ..Default::default() };
        let response = self.llm.complete(&messages, &options).await?;

        let mut descriptions: SchemaDescriptions = parse_llm_json(&response)?;
        descriptions.tables_descriptions.truncate(MAX_DESCRIPTIONS);
        descriptions.columns_descriptions.truncate(MAX_DESCRIPTIONS);

        Ok(descriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;

    struct CannedLlm(String);

    #[async_trait]
    impl ChatCompletion for CannedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn stub_json(tables: usize, columns: usize) -> String {
        let table_stubs: Vec<_> = (0..tables)
            .map(|i| serde_json::json!({"name": format!("t{}", i), "description": format!("table {}", i)}))
            .collect();
        let column_stubs: Vec<_> = (0..columns)
            .map(|i| serde_json::json!({"name": format!("c{}", i), "description": format!("column {}", i)}))
            .collect();
        serde_json::json!({
            "tables_descriptions": table_stubs,
            "columns_descriptions": column_stubs,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_generate_caps_at_five_each() {
        let generator = DescriptionGenerator::new(Arc::new(CannedLlm(stub_json(8, 7))));
        let descriptions = generator.generate("how many users", &[], "crm db").await.unwrap();
        assert_eq!(descriptions.tables_descriptions.len(), MAX_DESCRIPTIONS);
        assert_eq!(descriptions.columns_descriptions.len(), MAX_DESCRIPTIONS);
    }

    #[tokio::test]
    async fn test_texts_order_tables_then_columns() {
        let generator = DescriptionGenerator::new(Arc::new(CannedLlm(stub_json(2, 1))));
        let descriptions = generator.generate("q", &[], "db").await.unwrap();
        let texts = descriptions.texts();
        assert_eq!(texts, vec!["table 0", "table 1", "column 0"]);
    }

    #[tokio::test]
    async fn test_empty_descriptions() {
        let generator = DescriptionGenerator::new(Arc::new(CannedLlm(stub_json(0, 0))));
        let descriptions = generator.generate("q", &[], "db").await.unwrap();
        assert!(descriptions.is_empty());
    }
}
