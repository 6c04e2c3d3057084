//! Tracing instrumentation helpers.
//!
//! Spans emitted by this workspace carry an `otel.name` field taken from
//! [`span_names`], so an OpenTelemetry layer installed by the application
//! exports them under stable names. Statements are logged with their
//! literal values masked.

use once_cell::sync::Lazy;
use regex::Regex;

/// Span names for connection operations.
pub mod span_names {
    /// Opening a session.
    pub const CONNECT: &str = "dbpool.connect";
    /// Closing a session.
    pub const DISCONNECT: &str = "dbpool.disconnect";
    /// Checking a connection out of the pool.
    pub const CHECKOUT: &str = "dbpool.checkout";
    /// Executing a command.
    pub const EXECUTE: &str = "dbpool.execute";
    /// Beginning a transaction.
    pub const BEGIN_TRANSACTION: &str = "dbpool.begin_transaction";
    /// Committing a transaction.
    pub const COMMIT: &str = "dbpool.commit";
    /// Rolling back a transaction.
    pub const ROLLBACK: &str = "dbpool.rollback";
}

/// Statements longer than this many characters are cut when logged.
const MAX_LOGGED_STATEMENT_CHARS: usize = 512;

/// Quoted strings (doubled quotes included, unterminated runs to the end)
/// and bare numbers.
#[allow(clippy::expect_used)]
static LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(?:[^']|'')*(?:'|$)|"(?:[^"]|"")*(?:"|$)|\b\d+(?:\.\d+)?\b"#)
        .expect("literal pattern is valid")
});

/// The statement as it may appear in logs: literals replaced by `?` and
/// long statements cut short.
pub(crate) fn sanitize_statement(sql: &str) -> String {
    let masked = LITERAL_RE.replace_all(sql, "?");
    if masked.chars().count() <= MAX_LOGGED_STATEMENT_CHARS {
        return masked.into_owned();
    }
    let mut cut: String = masked.chars().take(MAX_LOGGED_STATEMENT_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Leading keyword of a statement, for the `operation` span field.
pub(crate) fn extract_operation(sql: &str) -> &'static str {
    let sql_upper = sql.trim_start().to_uppercase();

    const OPERATIONS: &[(&str, &str)] = &[
        ("SELECT", "SELECT"),
        ("INSERT", "INSERT"),
        ("REPLACE", "REPLACE"),
        ("UPDATE", "UPDATE"),
        ("DELETE", "DELETE"),
        ("CALL", "CALL"),
        ("START TRANSACTION", "BEGIN"),
        ("BEGIN", "BEGIN"),
        ("COMMIT", "COMMIT"),
        ("ROLLBACK", "ROLLBACK"),
        ("SAVEPOINT", "SAVEPOINT"),
        ("CREATE", "CREATE"),
        ("ALTER", "ALTER"),
        ("DROP", "DROP"),
    ];

    OPERATIONS
        .iter()
        .find(|(prefix, _)| sql_upper.starts_with(prefix))
        .map_or("OTHER", |&(_, op)| op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_literals() {
        let sql = "SELECT * FROM users WHERE name = 'O''Brien' AND level > 42";
        assert_eq!(
            sanitize_statement(sql),
            "SELECT * FROM users WHERE name = ? AND level > ?"
        );
    }

    #[test]
    fn test_identifiers_with_digits_are_kept() {
        assert_eq!(
            sanitize_statement("UPDATE table2 SET col_1 = 5"),
            "UPDATE table2 SET col_1 = ?"
        );
    }

    #[test]
    fn test_unterminated_string_is_masked() {
        assert_eq!(
            sanitize_statement("INSERT INTO t VALUES ('half"),
            "INSERT INTO t VALUES (?"
        );
        assert_eq!(sanitize_statement("SELECT \"x\" , 1.5"), "SELECT ? , ?");
    }

    #[test]
    fn test_long_statements_are_cut_on_char_boundaries() {
        let sql = format!("SELECT {}", "é".repeat(600));
        let logged = sanitize_statement(&sql);
        assert!(logged.ends_with("..."));
        assert_eq!(logged.chars().count(), MAX_LOGGED_STATEMENT_CHARS + 3);
    }

    #[test]
    fn test_extract_operation() {
        assert_eq!(extract_operation("  select 1"), "SELECT");
        assert_eq!(extract_operation("START TRANSACTION"), "BEGIN");
        assert_eq!(extract_operation("savepoint a"), "SAVEPOINT");
        assert_eq!(extract_operation("SHOW TABLES"), "OTHER");
    }
}
