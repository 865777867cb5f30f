//! LLM response parsing.
//!
//! Models asked for "JSON only" still wrap the object in prose or markdown
//! fences, and some emit several blocks. The contract here: strip fences,
//! then take the span from the first `{` to the last `}` and parse that.
//! This is a documented upstream quirk, isolated behind these functions.

use crate::error::{Result, Text2SqlError};
use serde::de::DeserializeOwned;

/// Strip markdown code fences around a response, if present.
fn strip_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Extract the widest `{...}` span from a response.
pub fn extract_json_block(response: &str) -> Option<&str> {
    let cleaned = strip_fences(response);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&cleaned[start..=end])
}

/// Parse a typed value out of an LLM response. The raw response is carried
/// in the error for diagnostics; callers decide whether a parse failure is
/// fatal or falls back.
pub fn parse_llm_json<T: DeserializeOwned>(response: &str) -> Result<T> {
    let block = extract_json_block(response).ok_or_else(|| {
        Text2SqlError::LlmParse(format!("No JSON object in response: {}", response))
    })?;

    serde_json::from_str(block)
        .map_err(|e| Text2SqlError::LlmParse(format!("{}. Response: {}", e, response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Sample {
        status: String,
    }

    #[test]
    fn test_parses_bare_json() {
        let parsed: Sample = parse_llm_json(r#"{"status": "On-topic"}"#).unwrap();
        assert_eq!(parsed.status, "On-topic");
    }

    #[test]
    fn test_parses_json_wrapped_in_prose() {
        let response = "Sure! Here is the answer:\n{\"status\": \"Off-topic\"}\nHope that helps.";
        let parsed: Sample = parse_llm_json(response).unwrap();
        assert_eq!(parsed.status, "Off-topic");
    }

    #[test]
    fn test_parses_fenced_json() {
        let response = "```json\n{\"status\": \"On-topic\"}\n```";
        let parsed: Sample = parse_llm_json(response).unwrap();
        assert_eq!(parsed.status, "On-topic");
    }

    #[test]
    fn test_multiple_blocks_take_widest_span() {
        // Nested objects: first '{' to last '}' covers the outer object.
        let response = r#"{"status": "On-topic", "nested": {"a": 1}}"#;
        let parsed: Sample = parse_llm_json(response).unwrap();
        assert_eq!(parsed.status, "On-topic");
    }

    #[test]
    fn test_missing_json_is_parse_error() {
        let err = parse_llm_json::<Sample>("I cannot answer that.").unwrap_err();
        match err {
            Text2SqlError::LlmParse(msg) => assert!(msg.contains("cannot answer")),
            other => panic!("expected LlmParse, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json_keeps_raw_text_in_error() {
        let err = parse_llm_json::<Sample>("{\"status\": ").unwrap_err();
        match err {
            Text2SqlError::LlmParse(msg) => assert!(msg.contains("{\"status\":")),
            other => panic!("expected LlmParse, got {:?}", other),
        }
    }
}
