//! SQL identifier sanitization.
//!
//! Generated SQL sometimes references tables whose names contain characters
//! the target dialect requires quoting for (dashes, spaces). This module
//! quotes known table names in place before execution.

use crate::loader::DatabaseType;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

/// Characters in an identifier that force quoting.
const SPECIAL_CHARS: &str = "- .@#$%^&*()+=[]{}|\\:;\"'<>,?/";

/// Keywords that must never be treated as table names to quote.
const SQL_KEYWORDS: [&str; 48] = [
    "SELECT", "FROM", "WHERE", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "ON", "AS", "AND", "OR",
    "NOT", "IN", "BETWEEN", "LIKE", "IS", "NULL", "ORDER", "BY", "GROUP", "HAVING", "LIMIT",
    "OFFSET", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "TABLE", "INTO", "VALUES",
    "SET", "COUNT", "SUM", "AVG", "MAX", "MIN", "DISTINCT", "ALL", "UNION", "INTERSECT", "EXCEPT",
    "CASE", "WHEN", "THEN", "ELSE",
];

lazy_static! {
    static ref TABLE_REF_PATTERNS: Vec<Regex> = [
        r"(?i)\bFROM\s+([a-zA-Z0-9_\-]+)",
        r"(?i)\bJOIN\s+([a-zA-Z0-9_\-]+)",
        r"(?i)\bUPDATE\s+([a-zA-Z0-9_\-]+)",
        r"(?i)\bINSERT\s+INTO\s+([a-zA-Z0-9_\-]+)",
        r"(?i)\bTABLE\s+([a-zA-Z0-9_\-]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect();
}

/// Identifier quote character for a dialect.
pub fn quote_char(db_type: DatabaseType) -> char {
    match db_type {
        DatabaseType::MySql => '`',
        DatabaseType::Postgres | DatabaseType::Sqlite => '"',
    }
}

fn is_quoted(identifier: &str) -> bool {
    (identifier.starts_with('"') && identifier.ends_with('"') && identifier.len() >= 2)
        || (identifier.starts_with('`') && identifier.ends_with('`') && identifier.len() >= 2)
}

/// Whether an identifier needs quoting: unquoted, not a keyword, and
/// containing at least one special character.
pub fn needs_quoting(identifier: &str) -> bool {
    if is_quoted(identifier) {
        return false;
    }
    if SQL_KEYWORDS.contains(&identifier.to_uppercase().as_str()) {
        return false;
    }
    identifier.chars().any(|c| SPECIAL_CHARS.contains(c))
}

pub fn quote_identifier(identifier: &str, quote: char) -> String {
    let identifier = identifier.trim();
    if is_quoted(identifier) {
        return identifier.to_string();
    }
    format!("{}{}{}", quote, identifier, quote)
}

/// Extract candidate table names referenced after FROM/JOIN/UPDATE/
/// INSERT INTO/TABLE. Heuristic, not a full parser.
pub fn extract_table_names(sql_query: &str) -> HashSet<String> {
    let mut names = HashSet::new();
    for pattern in TABLE_REF_PATTERNS.iter() {
        for capture in pattern.captures_iter(sql_query) {
            if let Some(name) = capture.get(1) {
                let name = name.as_str().trim();
                if !is_quoted(name) {
                    names.insert(name.to_string());
                }
            }
        }
    }
    names
}

/// Quote occurrences of known table names that need it. Returns the
/// (possibly rewritten) query and whether anything changed.
pub fn auto_quote_identifiers(
    sql_query: &str,
    known_tables: &HashSet<String>,
    quote: char,
) -> (String, bool) {
    let mut result = sql_query.to_string();
    let mut modified = false;

    for table in extract_table_names(sql_query) {
        if !known_tables.contains(&table) || !needs_quoting(&table) {
            continue;
        }

        let quoted = quote_identifier(&table, quote);
        let escaped = regex::escape(&table);

        // Qualified `table.column` references first, then bare references;
        // the bare pass skips matches already inside the quoted form.
        let qualified = Regex::new(&format!(r"(?i)\b{}\s*\.", escaped)).expect("escaped pattern");
        let with_dot = format!("{}.", quoted);
        // NoExpand: identifiers may contain `$`, which a plain string
        // replacer would treat as a capture reference.
        let rewritten = qualified
            .replace_all(&result, regex::NoExpand(&with_dot))
            .to_string();
        if rewritten != result {
            modified = true;
            result = rewritten;
        }

        let bare = Regex::new(&format!(r"(?i)\b{}\b", escaped)).expect("escaped pattern");
        let rewritten = bare
            .replace_all(&result, |caps: &regex::Captures| {
                let matched = caps.get(0).unwrap();
                // Skip matches already inside the quoted replacement.
                let preceding = result[..matched.start()].chars().next_back();
                if preceding == Some(quote) {
                    matched.as_str().to_string()
                } else {
                    quoted.clone()
                }
            })
            .to_string();
        if rewritten != result {
            modified = true;
            result = rewritten;
        }
    }

    (result, modified)
}
