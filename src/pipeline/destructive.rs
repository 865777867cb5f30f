//! Destructive operation gate.
//!
//! Mutating SQL (DDL or DML write) never executes without an explicit
//! "CONFIRM" reply. Shared demo graphs are a hard deny: no confirmation
//! path exists for them.

use serde::{Deserialize, Serialize};

/// Leading keywords that mutate data or schema.
pub const DESTRUCTIVE_OPERATIONS: [&str; 7] =
    ["INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE"];

/// Classify a statement by its leading keyword. Returns the operation type
/// when it is destructive.
pub fn classify_destructive(sql_query: &str) -> Option<String> {
    let first_word = sql_query.trim().split_whitespace().next()?.to_uppercase();
    if DESTRUCTIVE_OPERATIONS.contains(&first_word.as_str()) {
        Some(first_word)
    } else {
        None
    }
}

/// Whether a user reply confirms execution. Anything else cancels.
pub fn is_confirmed(reply: &str) -> bool {
    reply.trim().to_uppercase() == "CONFIRM"
}

fn operation_effect(operation_type: &str) -> &'static str {
    match operation_type {
        "INSERT" => "• Add new data to the database",
        "UPDATE" => "• Modify existing data in the database",
        "DELETE" => "• **PERMANENTLY DELETE** data from the database",
        "DROP" => "• **PERMANENTLY DELETE** entire tables or database objects",
        "CREATE" => "• Create new tables or database objects",
        "ALTER" => "• Modify the structure of existing tables",
        "TRUNCATE" => "• **PERMANENTLY DELETE ALL DATA** from specified tables",
        _ => "• Modify the database",
    }
}

/// Build the confirmation prompt shown to the user before a destructive
/// statement runs.
pub fn confirmation_message(sql_query: &str, operation_type: &str) -> String {
    format!(
        "⚠️ DESTRUCTIVE OPERATION DETECTED ⚠️\n\n\
         The generated SQL query will perform a **{}** operation:\n\n\
         SQL:\n{}\n\n\
         What this will do:\n{}\n\n\
         ⚠️ WARNING: This operation will make changes to your database and may be irreversible.\n",
        operation_type,
        sql_query,
        operation_effect(operation_type)
    )
}

/// Gate decision for a statement about to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Non-destructive, or already confirmed: run it.
    Execute,
    /// Destructive on a user graph: pause for confirmation.
    RequireConfirmation { operation_type: String },
    /// Destructive on a shared demo graph: never executed.
    Deny { reason: String },
}

/// Evaluate the gate for a statement. `is_demo_graph` marks shared demo
/// graphs, which reject destructive SQL outright.
pub fn evaluate(sql_query: &str, is_demo_graph: bool) -> GateDecision {
    match classify_destructive(sql_query) {
        None => GateDecision::Execute,
        Some(_) if is_demo_graph => GateDecision::Deny {
            reason: "Destructive operation not allowed on demo graphs".to_string(),
        },
        Some(operation_type) => GateDecision::RequireConfirmation { operation_type },
    }
}

/// Confirmation state machine for one proposed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateState {
    Proposed,
    AwaitingConfirmation,
    Executing,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    state: GateState,
    sql_query: String,
    operation_type: Option<String>,
    is_demo_graph: bool,
}

impl ConfirmationGate {
    pub fn new(sql_query: impl Into<String>, is_demo_graph: bool) -> Self {
        Self {
            state: GateState::Proposed,
            sql_query: sql_query.into(),
            operation_type: None,
            is_demo_graph,
        }
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn operation_type(&self) -> Option<&str> {
        self.operation_type.as_deref()
    }

    /// Advance from `Proposed`: non-destructive statements go straight to
    /// `Executing`; destructive ones wait for confirmation (or are
    /// cancelled outright on demo graphs).
    pub fn propose(&mut self) -> &GateState {
        debug_assert_eq!(self.state, GateState::Proposed);
        match classify_destructive(&self.sql_query) {
            None => self.state = GateState::Executing,
            Some(op) => {
                self.operation_type = Some(op);
                if self.is_demo_graph {
                    self.state = GateState::Cancelled;
                } else {
                    self.state = GateState::AwaitingConfirmation;
                }
            }
        }
        &self.state
    }

    /// Process the user's reply while awaiting confirmation. "CONFIRM"
    /// (case-insensitive, trimmed) executes; anything else cancels.
    pub fn reply(&mut self, reply: &str) -> &GateState {
        if self.state == GateState::AwaitingConfirmation {
            self.state = if is_confirmed(reply) {
                GateState::Executing
            } else {
                GateState::Cancelled
            };
        }
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_all_destructive_keywords() {
        for op in DESTRUCTIVE_OPERATIONS {
            let sql = format!("{} something", op.to_lowercase());
            assert_eq!(classify_destructive(&sql).as_deref(), Some(op));
        }
        assert!(classify_destructive("SELECT * FROM users").is_none());
        assert!(classify_destructive("  WITH cte AS (SELECT 1) SELECT * FROM cte").is_none());
        assert!(classify_destructive("").is_none());
    }

    #[test]
    fn test_is_confirmed_variants() {
        assert!(is_confirmed("CONFIRM"));
        assert!(is_confirmed("  confirm  "));
        assert!(!is_confirmed("yes"));
        assert!(!is_confirmed("CONFIRMED"));
        assert!(!is_confirmed(""));
    }

    #[test]
    fn test_gate_non_destructive_executes_directly() {
        let mut gate = ConfirmationGate::new("SELECT COUNT(id) FROM users", false);
        assert_eq!(gate.propose(), &GateState::Executing);
    }

    #[test]
    fn test_gate_destructive_requires_confirmation() {
        let mut gate = ConfirmationGate::new("DELETE FROM users", false);
        assert_eq!(gate.propose(), &GateState::AwaitingConfirmation);
        assert_eq!(gate.operation_type(), Some("DELETE"));
        assert_eq!(gate.reply("CONFIRM"), &GateState::Executing);
    }

    #[test]
    fn test_gate_any_other_reply_cancels() {
        let mut gate = ConfirmationGate::new("DROP TABLE users", false);
        gate.propose();
        assert_eq!(gate.reply("sure, go ahead"), &GateState::Cancelled);
    }

    #[test]
    fn test_gate_demo_graph_denies_destructive() {
        let mut gate = ConfirmationGate::new("TRUNCATE TABLE users", true);
        assert_eq!(gate.propose(), &GateState::Cancelled);
    }

    #[test]
    fn test_evaluate_demo_deny_beats_confirmation() {
        match evaluate("DELETE FROM users", true) {
            GateDecision::Deny { reason } => {
                assert!(reason.contains("demo"));
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[test]
    fn test_confirmation_message_mentions_operation() {
        let message = confirmation_message("DELETE FROM users", "DELETE");
        assert!(message.contains("**DELETE**"));
        assert!(message.contains("DELETE FROM users"));
        assert!(message.contains("PERMANENTLY DELETE"));
    }
}
