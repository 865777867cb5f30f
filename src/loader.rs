//! Relational database loader seam.
//!
//! Loaders physically introspect live databases and execute SQL; their
//! implementations are external collaborators. The pipeline depends on the
//! trait below plus the shared schema-modifying-statement detection.

use crate::error::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One result row from SQL execution: column name to JSON-serializable value.
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    Postgres,
    MySql,
    Sqlite,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgresql",
            DatabaseType::MySql => "mysql",
            DatabaseType::Sqlite => "sqlite",
        }
    }

    /// Resolve the database type from a connection URL. Unknown schemes
    /// fall back to Postgres for backward compatibility; empty or
    /// placeholder URLs resolve to nothing.
    pub fn from_url(url: &str) -> Option<DatabaseType> {
        if url.trim().is_empty() || url == "No URL available for this database." {
            return None;
        }

        let lower = url.to_lowercase();
        if lower.starts_with("postgresql://") || lower.starts_with("postgres://") {
            Some(DatabaseType::Postgres)
        } else if lower.starts_with("mysql://") {
            Some(DatabaseType::MySql)
        } else if lower.starts_with("sqlite://") {
            Some(DatabaseType::Sqlite)
        } else {
            Some(DatabaseType::Postgres)
        }
    }
}

/// DDL verbs that can change the schema.
pub const SCHEMA_MODIFYING_OPERATIONS: [&str; 5] = ["CREATE", "ALTER", "DROP", "RENAME", "TRUNCATE"];

lazy_static! {
    /// Specific statement shapes known to change the schema. A statement
    /// whose verb is DDL but matches none of these is still treated as
    /// schema-modifying (fail-safe toward re-indexing).
    static ref SCHEMA_PATTERNS: Vec<Regex> = [
        r"^\s*CREATE\s+TABLE",
        r"^\s*CREATE\s+INDEX",
        r"^\s*CREATE\s+UNIQUE\s+INDEX",
        r"^\s*ALTER\s+TABLE",
        r"^\s*DROP\s+TABLE",
        r"^\s*DROP\s+INDEX",
        r"^\s*RENAME\s+TABLE",
        r"^\s*TRUNCATE\s+TABLE",
        r"^\s*CREATE\s+VIEW",
        r"^\s*DROP\s+VIEW",
        r"^\s*CREATE\s+SCHEMA",
        r"^\s*DROP\s+SCHEMA",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("static pattern"))
    .collect();
}

/// Check whether a SQL statement modifies the database schema.
/// Returns the operation verb alongside the flag.
pub fn is_schema_modifying_query(sql_query: &str) -> (bool, String) {
    let normalized = sql_query.trim().to_uppercase();
    let Some(first_word) = normalized.split_whitespace().next() else {
        return (false, String::new());
    };

    if SCHEMA_MODIFYING_OPERATIONS.contains(&first_word) {
        for pattern in SCHEMA_PATTERNS.iter() {
            if pattern.is_match(&normalized) {
                return (true, first_word.to_string());
            }
        }
        // Known DDL verb without a specific pattern match: still treat as
        // schema-modifying.
        return (true, first_word.to_string());
    }

    (false, String::new())
}

/// Progress message streamed while a loader introspects a database.
pub type LoadProgress = (bool, String);

/// Loader seam: connects to a live relational database, extracts its schema
/// into the graph, and executes SQL on demand.
#[async_trait]
pub trait SqlLoader: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Introspect the database at `connection_url` and build the schema
    /// graph under `prefix`. Progress is streamed as (success, message)
    /// pairs; the final message carries the terminal status.
    async fn load(&self, prefix: &str, connection_url: &str)
        -> Result<mpsc::Receiver<LoadProgress>>;

    /// Execute one SQL statement against the live database.
    async fn execute_sql_query(&self, sql_query: &str, db_url: &str) -> Result<Vec<Row>>;

    /// Drop and rebuild the schema graph from the live database.
    /// Returns (success, message); the caller reports failure as a warning
    /// without undoing the SQL that triggered the refresh.
    async fn refresh_graph_schema(&self, graph_id: &str, db_url: &str) -> (bool, String);

    fn is_schema_modifying_query(&self, sql_query: &str) -> (bool, String) {
        is_schema_modifying_query(sql_query)
    }
}

/// Registry mapping database types to loader implementations.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: HashMap<DatabaseType, Arc<dyn SqlLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self { loaders: HashMap::new() }
    }

    pub fn register(&mut self, loader: Arc<dyn SqlLoader>) {
        self.loaders.insert(loader.database_type(), loader);
    }

    /// Resolve a loader from a connection URL.
    pub fn loader_for_url(&self, db_url: &str) -> Option<(DatabaseType, Arc<dyn SqlLoader>)> {
        let db_type = DatabaseType::from_url(db_url)?;
        self.loaders.get(&db_type).map(|l| (db_type, Arc::clone(l)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_from_url() {
        assert_eq!(
            DatabaseType::from_url("postgresql://u:p@host/db"),
            Some(DatabaseType::Postgres)
        );
        assert_eq!(
            DatabaseType::from_url("postgres://u:p@host/db"),
            Some(DatabaseType::Postgres)
        );
        assert_eq!(DatabaseType::from_url("mysql://host/db"), Some(DatabaseType::MySql));
        assert_eq!(DatabaseType::from_url("sqlite:///app.db"), Some(DatabaseType::Sqlite));
        assert_eq!(DatabaseType::from_url(""), None);
        assert_eq!(DatabaseType::from_url("No URL available for this database."), None);
        // Unknown schemes fall back to Postgres
        assert_eq!(
            DatabaseType::from_url("jdbc:weird://x"),
            Some(DatabaseType::Postgres)
        );
    }

    #[test]
    fn test_schema_modifying_detection_specific_patterns() {
        let (modifying, op) = is_schema_modifying_query("CREATE TABLE users (id int)");
        assert!(modifying);
        assert_eq!(op, "CREATE");

        let (modifying, op) = is_schema_modifying_query("  alter table users add col x int");
        assert!(modifying);
        assert_eq!(op, "ALTER");

        let (modifying, _) = is_schema_modifying_query("DROP VIEW active_users");
        assert!(modifying);
    }

    #[test]
    fn test_schema_modifying_fail_safe_on_unmatched_ddl() {
        // DDL verb, no specific pattern: still schema-modifying
        let (modifying, op) = is_schema_modifying_query("DROP SEQUENCE order_seq");
        assert!(modifying);
        assert_eq!(op, "DROP");
    }

    #[test]
    fn test_non_ddl_is_not_schema_modifying() {
        let (modifying, op) = is_schema_modifying_query("SELECT * FROM users");
        assert!(!modifying);
        assert!(op.is_empty());

        let (modifying, _) = is_schema_modifying_query("DELETE FROM users WHERE id = 1");
        assert!(!modifying);

        let (modifying, _) = is_schema_modifying_query("");
        assert!(!modifying);
    }
}
