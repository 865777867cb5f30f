//! Streamed pipeline events.
//!
//! Every pipeline run emits an ordered sequence of JSON events framed with a
//! fixed delimiter. `final_response` marks stream termination; the
//! confirmation flow omits it entirely (the stream there just ends).

use crate::config::MESSAGE_DELIMITER;
use crate::loader::Row;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Failed,
}

/// Event payloads, discriminated by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ReasoningStep {
        message: String,
    },
    SqlQuery {
        data: String,
        conf: i64,
        miss: String,
        amb: String,
        exp: String,
        is_valid: bool,
    },
    DestructiveConfirmation {
        message: String,
        sql_query: String,
        operation_type: String,
    },
    QueryResult {
        data: Vec<Row>,
    },
    HealingAttempt {
        message: String,
        original_error: String,
        healed_sql: String,
    },
    HealingSuccess {
        message: String,
    },
    SchemaRefresh {
        message: String,
        refresh_status: RefreshStatus,
    },
    AiResponse {
        message: String,
    },
    FollowupQuestions {
        message: String,
        #[serde(default)]
        missing_information: String,
        #[serde(default)]
        ambiguities: String,
    },
    Error {
        message: String,
    },
    OperationCancelled {
        message: String,
    },
    FinalResult {
        success: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<bool>,
}

impl PipelineEvent {
    /// Intermediate event in the main flow.
    pub fn step(kind: EventKind) -> Self {
        Self { kind, final_response: Some(false) }
    }

    /// Terminal event in the main flow.
    pub fn terminal(kind: EventKind) -> Self {
        Self { kind, final_response: Some(true) }
    }

    /// Event in a flow that does not carry the `final_response` flag
    /// (the confirmation and load flows).
    pub fn unflagged(kind: EventKind) -> Self {
        Self { kind, final_response: None }
    }

    pub fn is_terminal(&self) -> bool {
        self.final_response == Some(true)
    }

    /// Wire encoding: compact JSON plus the frame delimiter.
    pub fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialization of these shapes cannot fail; keep the stream
            // alive if it somehow does.
            r#"{"type":"error","message":"Event serialization failed","final_response":true}"#
                .to_string()
        });
        format!("{}{}", json, MESSAGE_DELIMITER)
    }

    pub fn reasoning(message: impl Into<String>) -> Self {
        Self::step(EventKind::ReasoningStep { message: message.into() })
    }

    pub fn error_terminal(message: impl Into<String>) -> Self {
        Self::terminal(EventKind::Error { message: message.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_encoding_has_type_tag_and_delimiter() {
        let event = PipelineEvent::reasoning("Step 1: Analyzing user query and generating SQL...");
        let encoded = event.encode();
        assert!(encoded.ends_with(MESSAGE_DELIMITER));
        let json: serde_json::Value =
            serde_json::from_str(encoded.trim_end_matches(MESSAGE_DELIMITER)).unwrap();
        assert_eq!(json["type"], "reasoning_step");
        assert_eq!(json["final_response"], false);
    }

    #[test]
    fn test_unflagged_event_omits_final_response() {
        let event = PipelineEvent::unflagged(EventKind::QueryResult { data: vec![] });
        let json: serde_json::Value =
            serde_json::from_str(event.encode().trim_end_matches(MESSAGE_DELIMITER)).unwrap();
        assert_eq!(json["type"], "query_result");
        assert!(json.get("final_response").is_none());
    }

    #[test]
    fn test_sql_query_event_field_names() {
        let event = PipelineEvent::step(EventKind::SqlQuery {
            data: "SELECT COUNT(id) FROM users".to_string(),
            conf: 90,
            miss: String::new(),
            amb: String::new(),
            exp: "count of users".to_string(),
            is_valid: true,
        });
        let json: serde_json::Value =
            serde_json::from_str(event.encode().trim_end_matches(MESSAGE_DELIMITER)).unwrap();
        assert_eq!(json["type"], "sql_query");
        assert_eq!(json["conf"], 90);
        assert_eq!(json["is_valid"], true);
        assert!(json.get("miss").is_some());
        assert!(json.get("amb").is_some());
        assert!(json.get("exp").is_some());
    }

    #[test]
    fn test_schema_refresh_status_serialization() {
        let event = PipelineEvent::step(EventKind::SchemaRefresh {
            message: "refreshed".to_string(),
            refresh_status: RefreshStatus::Success,
        });
        let json: serde_json::Value =
            serde_json::from_str(event.encode().trim_end_matches(MESSAGE_DELIMITER)).unwrap();
        assert_eq!(json["refresh_status"], "success");
    }

    #[test]
    fn test_terminal_flag() {
        assert!(PipelineEvent::error_terminal("boom").is_terminal());
        assert!(!PipelineEvent::reasoning("step").is_terminal());
        assert!(!PipelineEvent::unflagged(EventKind::AiResponse { message: "x".into() })
            .is_terminal());
    }
}
