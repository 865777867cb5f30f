//! Relevancy classification.
//!
//! Decides whether a question belongs to the connected database before any
//! SQL work starts. History matters: "my orders" is on-topic when an
//! earlier turn already established who the user is.

use crate::agents::parser::parse_llm_json;
use crate::error::Result;
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use crate::pipeline::history::ConversationHistory;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const RELEVANCY_PROMPT: &str = r#"
You are an expert assistant tasked with determining whether the user's question aligns with a given database description and whether the question is appropriate. You receive two inputs:

The user's question: {QUESTION_PLACEHOLDER}
The database description: {DB_PLACEHOLDER}
Please follow these instructions:

Understand the question in the context of the database.
• Ask yourself: "Does this question relate to the data or concepts described in the database description?"
• Common tables that can be found in most of the systems considered "On-topic" even if it not explicit in the database description.
• Don't answer questions that related to yourself.
• Don't answer questions that related to personal information unless it related to data in the schemas.
• Questions about the user's (first person) defined as "personal" and is Off-topic, unless the conversation history already resolves who the user is.

Determine if the question is:
• On-topic and appropriate:
{"status": "On-topic", "reason": "Brief explanation of why it is on-topic and appropriate.", "suggestions": []}

• Off-topic:
{"status": "Off-topic", "reason": "Short reason explaining why it is off-topic.", "suggestions": ["An alternative, high-level question about the schema..."]}

• Inappropriate:
{"status": "Inappropriate", "reason": "Short reason why it is inappropriate.", "suggestions": ["Suggested topics that would be more appropriate..."]}

Respond with exactly one of these JSON objects and nothing else.
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelevancyStatus {
    #[serde(rename = "On-topic")]
    OnTopic,
    #[serde(rename = "Off-topic")]
    OffTopic,
    #[serde(rename = "Inappropriate")]
    Inappropriate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelevancyVerdict {
    pub status: RelevancyStatus,
    pub reason: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl RelevancyVerdict {
    pub fn is_on_topic(&self) -> bool {
        self.status == RelevancyStatus::OnTopic
    }
}

pub struct RelevancyAgent {
    llm: Arc<dyn ChatCompletion>,
    messages: Vec<ChatMessage>,
}

impl RelevancyAgent {
    /// Seed the agent with the completed turns of the conversation.
    pub fn new(llm: Arc<dyn ChatCompletion>, history: &ConversationHistory) -> Self {
        Self { llm, messages: history.message_buffer() }
    }

    /// Classify the current question against the database description.
    /// Deterministic: temperature 0, strict JSON parse.
    pub async fn classify(
        &mut self,
        user_question: &str,
        db_description: &str,
    ) -> Result<RelevancyVerdict> {
        let prompt = RELEVANCY_PROMPT
            .replace("{QUESTION_PLACEHOLDER}", user_question)
            .replace("{DB_PLACEHOLDER}", db_description);

        self.messages.push(ChatMessage::user(prompt));

        let response = self
            .llm
            .complete(&self.messages, &CompletionOptions::default())
            .await?;
        self.messages.push(ChatMessage::assistant(response.clone()));

        parse_llm_json(&response)
    }
}
