//! Follow-up question generation.
//!
//! When a question cannot be translated, this agent turns the analysis
//! verdict into a short conversational reply asking for what's missing.

use crate::agents::analysis::AnalysisVerdict;
use crate::error::Result;
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use std::sync::Arc;
use tracing::warn;

const FOLLOW_UP_GENERATION_PROMPT: &str = r#"
You are a helpful database expert. A colleague asked a question, but their query can't run correctly.

Context:
- Question: "{QUESTION}"
- Translatability: {IS_TRANSLATABLE}
- Missing info: {MISSING_INFO}
- Ambiguities: {AMBIGUITIES}
- Analysis: {EXPLANATION}

Your task:
- Write a **very short response (max 2 sentences, under 40 words total)**.
- Sentence 1: Acknowledge warmly and show willingness to help, without being technical.
- Sentence 2: Ask for the specific missing information in natural, conversational language.
- **If the query uses "I", "my", or "me" → always ask who they are (name, employee ID, or username).**
- Use warm, natural wording like "I need to know who you are" instead of "provide your ID."
- Keep the tone friendly, encouraging, and solution-focused — like a helpful colleague, not a system.
"#;

const FALLBACK_RESPONSE: &str = "I'm having trouble generating a follow-up question right now. \
    Could you try rephrasing your question or providing more specific details about what you're \
    looking for?";

pub struct FollowUpAgent {
    llm: Arc<dyn ChatCompletion>,
}

impl FollowUpAgent {
    pub fn new(llm: Arc<dyn ChatCompletion>) -> Self {
        Self { llm }
    }

    /// Generate a conversational follow-up for a non-translatable verdict.
    /// Never fails: an LLM error degrades to a static fallback.
    pub async fn generate(&self, user_question: &str, verdict: &AnalysisVerdict) -> Result<String> {
        let prompt = FOLLOW_UP_GENERATION_PROMPT
            .replace("{QUESTION}", user_question)
            .replace("{IS_TRANSLATABLE}", &verdict.is_sql_translatable.to_string())
            .replace("{MISSING_INFO}", &verdict.missing_information)
            .replace("{AMBIGUITIES}", &verdict.ambiguities)
            .replace("{EXPLANATION}", &verdict.explanation);

        // Creative register: this is conversational text, not SQL.
        let options = CompletionOptions::with_temperature(0.9);
        match self
            .llm
            .complete(&[ChatMessage::user(prompt)], &options)
            .await
        {
            Ok(response) => Ok(response.trim().to_string()),
            Err(e) => {
                warn!("Follow-up generation failed: {}", e);
                Ok(FALLBACK_RESPONSE.to_string())
            }
        }
    }
}
