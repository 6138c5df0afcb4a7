//! Read-only guard
//!
//! Only single `SELECT` / `WITH ... SELECT` statements may pass. Checked in
//! the validation stage and again at the engine boundary.

use lazy_static::lazy_static;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use std::fmt;

pub const WRITE_OPERATION_FORBIDDEN: &str = "write operation forbidden";

lazy_static! {
    static ref FORBIDDEN_KEYWORDS: HashSet<&'static str> = [
        "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "MERGE",
        "UPSERT", "GRANT", "REVOKE", "ATTACH", "DETACH", "COPY", "PRAGMA", "CALL",
        "EXEC", "EXECUTE", "INSTALL", "LOAD", "EXPORT", "IMPORT", "VACUUM", "RENAME",
        "CHECKPOINT", "INTO", "REINDEX", "ANALYZE", "LOCK", "UNLOCK", "BEGIN",
        "COMMIT", "ROLLBACK", "SAVEPOINT", "SET", "RESET", "USE",
    ]
    .into_iter()
    .collect();
    static ref ALLOWED_LEADING: HashSet<&'static str> = ["SELECT", "WITH"].into_iter().collect();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    /// A write, DDL or administrative operation. Never repaired.
    Forbidden { detail: String },
    /// The text does not parse, or is empty.
    Malformed { detail: String },
}

impl fmt::Display for GuardViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardViolation::Forbidden { detail } => {
                write!(f, "{} ({})", WRITE_OPERATION_FORBIDDEN, detail)
            }
            GuardViolation::Malformed { detail } => write!(f, "malformed SQL: {}", detail),
        }
    }
}

/// Unquoted keyword text of a token, uppercased.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        _ => None,
    }
}

/// Check that `sql` is a single read-only query.
pub fn check_read_only(sql: &str) -> std::result::Result<(), GuardViolation> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| GuardViolation::Malformed { detail: e.to_string() })?;
    let mut significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    while matches!(significant.last(), Some(Token::SemiColon)) {
        significant.pop();
    }
    if significant.is_empty() {
        return Err(GuardViolation::Malformed {
            detail: "empty statement".to_string(),
        });
    }

    if significant.iter().any(|t| matches!(t, Token::SemiColon)) {
        return Err(GuardViolation::Forbidden {
            detail: "multiple statements".to_string(),
        });
    }

    let leading = significant.iter().find(|t| !matches!(t, Token::LParen));
    match leading.and_then(|t| keyword(t)) {
        Some(kw) if ALLOWED_LEADING.contains(kw.as_str()) => {}
        Some(kw) => {
            return Err(GuardViolation::Forbidden {
                detail: format!("statement starts with {}", kw),
            })
        }
        None => {
            return Err(GuardViolation::Malformed {
                detail: "statement does not start with a keyword".to_string(),
            })
        }
    }

    if let Some(kw) = significant
        .iter()
        .filter_map(|t| keyword(t))
        .find(|kw| FORBIDDEN_KEYWORDS.contains(kw.as_str()))
    {
        return Err(GuardViolation::Forbidden {
            detail: format!("keyword {}", kw),
        });
    }

    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| GuardViolation::Malformed { detail: e.to_string() })?;
    if statements.len() != 1 {
        return Err(GuardViolation::Forbidden {
            detail: "multiple statements".to_string(),
        });
    }
    if let Some(other) = statements.iter().find(|s| !matches!(s, Statement::Query(_))) {
        let text = other.to_string();
        let head = text.split_whitespace().next().unwrap_or("statement").to_uppercase();
        return Err(GuardViolation::Forbidden {
            detail: format!("{} statement", head),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forbidden(sql: &str) -> bool {
        matches!(check_read_only(sql), Err(GuardViolation::Forbidden { .. }))
    }

    #[test]
    fn test_select_allowed() {
        assert!(check_read_only("SELECT region, SUM(price) FROM international_sales GROUP BY region").is_ok());
        assert!(check_read_only("with t as (select 1 as x) select x from t;").is_ok());
        assert!(check_read_only("(SELECT a FROM t) UNION (SELECT a FROM u)").is_ok());
    }

    #[test]
    fn test_write_operations_rejected_case_insensitive() {
        assert!(forbidden("DROP TABLE international_sales"));
        assert!(forbidden("drop table international_sales"));
        assert!(forbidden("DeLeTe FROM international_sales"));
        assert!(forbidden("INSERT INTO t VALUES (1)"));
        assert!(forbidden("SELECT * INTO backup FROM t"));
        assert!(forbidden("SELECT 1; DROP TABLE t"));
        assert!(forbidden("WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x"));
        assert!(forbidden("PRAGMA table_info('t')"));
    }

    #[test]
    fn test_keywords_inside_literals_and_quotes_ignored() {
        assert!(check_read_only("SELECT * FROM logs WHERE message = 'DROP TABLE users'").is_ok());
        assert!(check_read_only("SELECT \"update\" FROM audit").is_ok());
    }

    #[test]
    fn test_violation_message() {
        let err = check_read_only("DROP TABLE t").unwrap_err();
        assert!(err.to_string().starts_with(WRITE_OPERATION_FORBIDDEN));
        assert!(matches!(check_read_only("   "), Err(GuardViolation::Malformed { .. })));
        assert!(matches!(
            check_read_only("SELECT (region FROM sales"),
            Err(GuardViolation::Malformed { .. })
        ));
    }
}
