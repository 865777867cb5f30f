//! SQL healing.
//!
//! When a generated statement fails against the live database, the healer
//! runs a bounded repair loop: a lightweight static validation enriches the
//! error context, the LLM proposes a fix, the fix is re-executed, and each
//! new failure is appended to the same conversational transcript so the
//! model sees its own previous attempt. On exhaustion the original failure
//! is what surfaces, never an intermediate one.

use crate::agents::parser::parse_llm_json;
use crate::error::Result;
use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
use crate::loader::DatabaseType;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_MAX_HEALING_ATTEMPTS: u8 = 3;

/// Static validation result. Informational only: it never blocks
/// execution, it only sharpens the error context handed to the model.
#[derive(Debug, Clone, Default)]
pub struct SqlValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

lazy_static! {
    static ref DANGEROUS_PATTERNS: Vec<Regex> = [
        r"\bDROP\s+TABLE\b",
        r"\bTRUNCATE\b",
        r"\bDELETE\s+FROM\s+\w+\s*;?\s*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect();
}

fn parser_dialect(database_type: DatabaseType) -> Box<dyn Dialect> {
    match database_type {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySql => Box::new(MySqlDialect {}),
        DatabaseType::Sqlite => Box::new(SQLiteDialect {}),
    }
}

/// Validate a statement for basic structural problems: emptiness, missing
/// SQL verb, unbalanced parentheses, SELECT without FROM, dangerous
/// operations, and a best-effort parser probe.
pub fn validate_sql_syntax(sql_query: &str, database_type: DatabaseType) -> SqlValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let query = sql_query.trim();
    if query.is_empty() {
        return SqlValidation {
            is_valid: false,
            errors: vec!["Query is empty".to_string()],
            warnings,
        };
    }

    let query_upper = query.to_uppercase();
    let has_sql_keywords = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH", "CREATE"]
        .iter()
        .any(|kw| query_upper.contains(kw));
    if !has_sql_keywords {
        errors.push("Query does not contain valid SQL keywords".to_string());
    }

    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(&query_upper) {
            warnings.push(format!(
                "Query contains potentially dangerous operation: {}",
                pattern.as_str()
            ));
        }
    }

    let mut paren_count: i64 = 0;
    let mut unbalanced = false;
    for c in query.chars() {
        match c {
            '(' => paren_count += 1,
            ')' => {
                paren_count -= 1;
                if paren_count < 0 {
                    unbalanced = true;
                    break;
                }
            }
            _ => {}
        }
    }
    if unbalanced || paren_count != 0 {
        errors.push("Unbalanced parentheses in query".to_string());
    }

    if query_upper.contains("SELECT") && !query_upper.contains("FROM") && !query_upper.contains("DUAL")
    {
        warnings.push("SELECT query missing FROM clause".to_string());
    }

    // Parser probe: a parse failure is context for the model, not a veto.
    if let Err(e) = Parser::parse_sql(parser_dialect(database_type).as_ref(), query) {
        warnings.push(format!("Parser error: {}", e));
    }

    SqlValidation { is_valid: errors.is_empty(), errors, warnings }
}

/// Dialect-specific error hints derived from the error text.
pub fn analyze_error(error_message: &str, database_type: DatabaseType) -> String {
    let error_lower = error_message.to_lowercase();
    let mut hints = Vec::new();

    match database_type {
        DatabaseType::Sqlite => {
            if error_lower.contains("near \"from\"") || error_lower.contains("syntax error") {
                hints.push("⚠️  EXTRACT() is NOT supported in SQLite - use strftime() instead!".to_string());
                hints.push("   Example: strftime('%Y', date_column) for year".to_string());
            }
            if error_lower.contains("no such column") {
                hints.push("⚠️  Column name doesn't exist - check spelling and case".to_string());
                hints.push("   SQLite is case-insensitive but the column must exist".to_string());
            }
            if error_lower.contains("no such table") {
                hints.push("⚠️  Table name doesn't exist - check spelling".to_string());
            }
            if error_lower.contains("ambiguous column") {
                hints.push("⚠️  Ambiguous column - use table alias: table.column or alias.column".to_string());
            }
        }
        DatabaseType::Postgres => {
            if error_lower.contains("column") && error_lower.contains("does not exist") {
                hints.push("⚠️  Column case mismatch - PostgreSQL is case-sensitive".to_string());
                hints.push("   Use double quotes for mixed-case: \"ColumnName\"".to_string());
            }
            if error_lower.contains("relation") && error_lower.contains("does not exist") {
                hints.push("⚠️  Table doesn't exist or case mismatch".to_string());
            }
        }
        DatabaseType::MySql => {
            if error_lower.contains("unknown column") {
                hints.push("⚠️  Column name doesn't exist - check spelling".to_string());
            }
        }
    }

    if hints.is_empty() {
        hints.push(format!(
            "⚠️  Check syntax compatibility with {}",
            database_type.as_str().to_uppercase()
        ));
        hints.push("⚠️  Verify column and table names exist".to_string());
    }

    hints.join("\n")
}

fn dialect_rules(database_type: DatabaseType) -> &'static str {
    match database_type {
        DatabaseType::Sqlite => {
            "
- SQLite does NOT support EXTRACT() function - use strftime() instead
  * EXTRACT(YEAR FROM date_col) → strftime('%Y', date_col)
  * EXTRACT(MONTH FROM date_col) → strftime('%m', date_col)
  * EXTRACT(DAY FROM date_col) → strftime('%d', date_col)
- SQLite column/table names are case-insensitive BUT must exist
- SQLite uses double quotes \"column\" for identifiers with special characters
- No schema qualifiers (database.table.column)
"
        }
        DatabaseType::Postgres => {
            "
- PostgreSQL is case-sensitive - use double quotes for mixed-case identifiers
- EXTRACT() is supported: EXTRACT(YEAR FROM date_col)
- Column references must match exact case when quoted
"
        }
        DatabaseType::MySql => {
            "
- MySQL uses backticks `column` for identifiers with special characters
- Date functions: YEAR(date_col), MONTH(date_col), DAY(date_col)
"
        }
    }
}

/// A fix proposed by the model.
#[derive(Debug, Clone, Deserialize)]
pub struct HealedQuery {
    pub sql_query: String,
    #[serde(default)]
    pub confidence: i64,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub changes_made: Vec<String>,
}

/// Bookkeeping for one repair loop. Created at the first execution
/// failure, discarded after success or exhaustion.
#[derive(Debug)]
pub struct HealingSession {
    pub attempts_used: u8,
    pub max_attempts: u8,
    pub transcript: Vec<ChatMessage>,
    pub final_sql: Option<String>,
    pub final_error: Option<String>,
    original_error: String,
    failed_sql: String,
}

impl HealingSession {
    pub fn new(failed_sql: &str, original_error: &str, max_attempts: u8) -> Self {
        Self {
            attempts_used: 0,
            max_attempts,
            transcript: Vec::new(),
            final_sql: None,
            final_error: None,
            original_error: original_error.to_string(),
            failed_sql: failed_sql.to_string(),
        }
    }

    pub fn can_attempt(&self) -> bool {
        self.attempts_used < self.max_attempts
    }

    /// The pre-healing failure. This is what the user sees on exhaustion.
    pub fn original_error(&self) -> &str {
        &self.original_error
    }

    /// Record that the proposed fix also failed, feeding the new error back
    /// into the transcript so the model sees its own failed attempt.
    pub fn record_execution_failure(&mut self, error: &str, database_type: DatabaseType) {
        self.final_error = Some(error.to_string());
        self.transcript.push(ChatMessage::user(format!(
            "The corrected query still failed with this error:\n{}\n\n{}\n\nFix the query again. Respond with the same JSON structure.",
            error,
            analyze_error(error, database_type),
        )));
    }

    fn record_unparseable_response(&mut self) {
        self.transcript.push(ChatMessage::user(
            "Your previous response could not be parsed. Respond ONLY with the JSON object \
             containing a non-empty \"sql_query\" field."
                .to_string(),
        ));
    }
}

pub struct HealerAgent {
    llm: Arc<dyn ChatCompletion>,
}

impl HealerAgent {
    pub fn new(llm: Arc<dyn ChatCompletion>) -> Self {
        Self { llm }
    }

    pub fn start_session(
        &self,
        failed_sql: &str,
        original_error: &str,
        max_attempts: u8,
    ) -> HealingSession {
        HealingSession::new(failed_sql, original_error, max_attempts)
    }

    /// Ask the model for a fix. Consumes one attempt. Returns `None` when
    /// the response could not be parsed into a usable fix; the malformed
    /// exchange stays in the transcript as feedback for the next attempt.
    pub async fn propose_fix(
        &self,
        session: &mut HealingSession,
        db_description: &str,
        question: &str,
        database_type: DatabaseType,
    ) -> Result<Option<HealedQuery>> {
        if session.transcript.is_empty() {
            let prompt = self.build_healing_prompt(
                &session.failed_sql,
                &session.original_error,
                db_description,
                question,
                database_type,
            );
            session.transcript.push(ChatMessage::user(prompt));
        }

        session.attempts_used += 1;

        let options = CompletionOptions {
            temperature: 0.1,
            max_tokens: Some(2000),
            json_response: false,
        };
        let response = self.llm.complete(&session.transcript, &options).await?;
        session.transcript.push(ChatMessage::assistant(response.clone()));

        match parse_llm_json::<HealedQuery>(&response) {
            Ok(healed) if !healed.sql_query.trim().is_empty() => {
                session.final_sql = Some(healed.sql_query.clone());
                Ok(Some(healed))
            }
            Ok(_) => {
                warn!("Healer returned an empty sql_query");
                session.record_unparseable_response();
                Ok(None)
            }
            Err(e) => {
                warn!("Failed to parse healer response: {}", e);
                session.record_unparseable_response();
                Ok(None)
            }
        }
    }

    fn build_healing_prompt(
        &self,
        failed_sql: &str,
        error_message: &str,
        db_description: &str,
        question: &str,
        database_type: DatabaseType,
    ) -> String {
        // Static validation enriches the error context handed to the model.
        let validation = validate_sql_syntax(failed_sql, database_type);
        let mut enhanced_error = error_message.to_string();
        if !validation.errors.is_empty() {
            enhanced_error.push_str(&format!("\nSyntax errors: {}", validation.errors.join(", ")));
        }
        if !validation.warnings.is_empty() {
            enhanced_error.push_str(&format!("\nWarnings: {}", validation.warnings.join(", ")));
        }

        let db_name = database_type.as_str().to_uppercase();
        let db_info = if db_description.is_empty() {
            String::new()
        } else {
            let truncated: String = db_description.chars().take(500).collect();
            format!("DATABASE INFO: {}\n", truncated)
        };
        let question_line = if question.is_empty() {
            String::new()
        } else {
            format!("ORIGINAL QUESTION: {}\n", question)
        };

        format!(
            r#"You are a SQL query debugging expert. Your task is to fix a SQL query that failed execution.

DATABASE TYPE: {db_name}

FAILED SQL QUERY:
```sql
{failed_sql}
```

EXECUTION ERROR:
{enhanced_error}

{question_line}{db_info}
COMMON ERROR PATTERNS:
{error_hints}

YOUR TASK:
1. Identify the exact cause of the error
2. Fix ONLY what's broken - don't rewrite the entire query
3. Ensure the fix is compatible with {db_name}
4. Maintain the original query logic and intent

CRITICAL RULES FOR {db_name}:
{dialect_rules}
RESPONSE FORMAT (valid JSON only):
{{
  "sql_query": "-- your fixed SQL query here",
  "confidence": 85,
  "explanation": "Brief explanation of what was fixed",
  "changes_made": ["Changed EXTRACT to strftime", "Fixed column casing"]
}}

IMPORTANT:
- Return ONLY the JSON object, no other text
- Fix ONLY the specific error, preserve the rest
- If error is about a column/table name, check spelling carefully"#,
            db_name = db_name,
            failed_sql = failed_sql,
            enhanced_error = enhanced_error,
            question_line = question_line,
            db_info = db_info,
            error_hints = analyze_error(error_message, database_type),
            dialect_rules = dialect_rules(database_type),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct SequencedLlm {
        responses: Mutex<Vec<String>>,
    }

    impl SequencedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ChatCompletion for SequencedLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String> {
            Ok(self.responses.lock().unwrap().pop().unwrap_or_default())
        }
    }

    #[test]
    fn test_validate_empty_query() {
        let validation = validate_sql_syntax("", DatabaseType::Sqlite);
        assert!(!validation.is_valid);
        assert_eq!(validation.errors, vec!["Query is empty".to_string()]);
    }

    #[test]
    fn test_validate_missing_sql_verb() {
        let validation = validate_sql_syntax("hello world", DatabaseType::Postgres);
        assert!(!validation.is_valid);
        assert!(validation
            .errors
            .iter()
            .any(|e| e.contains("valid SQL keywords")));
    }

    #[test]
    fn test_validate_unbalanced_parentheses() {
        let validation =
            validate_sql_syntax("SELECT COUNT(id FROM users", DatabaseType::Postgres);
        assert!(validation.errors.iter().any(|e| e.contains("Unbalanced")));

        let validation = validate_sql_syntax("SELECT id) FROM users", DatabaseType::Postgres);
        assert!(validation.errors.iter().any(|e| e.contains("Unbalanced")));
    }

    #[test]
    fn test_validate_select_without_from_is_warning_only() {
        let validation = validate_sql_syntax("SELECT 1 + 1", DatabaseType::Sqlite);
        assert!(validation.is_valid);
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("missing FROM")));
    }

    #[test]
    fn test_validate_flags_dangerous_operations() {
        let validation = validate_sql_syntax("DELETE FROM users", DatabaseType::Postgres);
        assert!(validation.is_valid);
        assert!(validation.warnings.iter().any(|w| w.contains("dangerous")));
    }

    #[test]
    fn test_sqlite_extract_hint() {
        let hints = analyze_error("syntax error near \"FROM\"", DatabaseType::Sqlite);
        assert!(hints.contains("strftime"));
    }

    #[test]
    fn test_postgres_case_hint() {
        let hints = analyze_error("column \"Name\" does not exist", DatabaseType::Postgres);
        assert!(hints.contains("case-sensitive"));
    }

    #[tokio::test]
    async fn test_propose_fix_parses_and_records_transcript() {
        let llm = Arc::new(SequencedLlm::new(vec![
            r#"{"sql_query": "SELECT strftime('%Y', date) FROM events", "confidence": 90,
                "explanation": "strftime instead of EXTRACT", "changes_made": ["Changed EXTRACT to strftime"]}"#,
        ]));
        let healer = HealerAgent::new(llm);
        let mut session = healer.start_session(
            "SELECT EXTRACT(YEAR FROM date) FROM events",
            "no such column: yr",
            3,
        );

        let fix = healer
            .propose_fix(&mut session, "", "events per year", DatabaseType::Sqlite)
            .await
            .unwrap()
            .unwrap();

        assert!(fix.sql_query.contains("strftime"));
        assert_eq!(session.attempts_used, 1);
        assert_eq!(session.final_sql.as_deref(), Some(fix.sql_query.as_str()));
        // user prompt + assistant reply
        assert_eq!(session.transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_response_consumes_attempt_and_feeds_back() {
        let llm = Arc::new(SequencedLlm::new(vec!["I give up"]));
        let healer = HealerAgent::new(llm);
        let mut session = healer.start_session("SELECT 1", "boom", 3);

        let fix = healer
            .propose_fix(&mut session, "", "", DatabaseType::Postgres)
            .await
            .unwrap();
        assert!(fix.is_none());
        assert_eq!(session.attempts_used, 1);
        // Feedback message appended for the next attempt
        assert_eq!(session.transcript.last().unwrap().role, "user");
    }

    #[tokio::test]
    async fn test_session_bound_and_original_error_preserved() {
        let llm = Arc::new(SequencedLlm::new(vec![
            r#"{"sql_query": "SELECT a FROM t"}"#,
            r#"{"sql_query": "SELECT b FROM t"}"#,
            r#"{"sql_query": "SELECT c FROM t"}"#,
        ]));
        let healer = HealerAgent::new(llm);
        let mut session = healer.start_session("SELECT x FROM t", "no such column: x", 3);

        while session.can_attempt() {
            let fix = healer
                .propose_fix(&mut session, "", "", DatabaseType::Postgres)
                .await
                .unwrap();
            assert!(fix.is_some());
            session.record_execution_failure("still broken", DatabaseType::Postgres);
        }

        assert_eq!(session.attempts_used, session.max_attempts);
        assert!(!session.can_attempt());
        // The pre-healing error is what must surface, not "still broken".
        assert_eq!(session.original_error(), "no such column: x");
        assert_eq!(session.final_error.as_deref(), Some("still broken"));
    }
}
