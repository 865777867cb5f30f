//! Small sanitization helpers shared across the pipeline.

/// Sanitize a user query before logging: collapse newlines and cap length.
pub fn sanitize_query(query: &str) -> String {
    query
        .replace('\n', " ")
        .replace('\r', " ")
        .chars()
        .take(500)
        .collect()
}

/// Sanitize arbitrary input for safe log interpolation.
pub fn sanitize_log_input(value: &str) -> String {
    value
        .replace('\n', " ")
        .replace('\r', " ")
        .replace('\t', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_query_strips_newlines_and_caps() {
        let long = format!("a\nb\r{}", "x".repeat(600));
        let sanitized = sanitize_query(&long);
        assert!(!sanitized.contains('\n'));
        assert!(!sanitized.contains('\r'));
        assert_eq!(sanitized.chars().count(), 500);
    }

    #[test]
    fn test_sanitize_log_input() {
        assert_eq!(sanitize_log_input("a\nb\tc\rd"), "a b c d");
    }
}
