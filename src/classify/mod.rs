//! SQL Statement Classification
//!
//! Guards only need to know whether an `execute` call could have changed data,
//! which decides the missing-read-only check. Classification is keyword based
//! and conservative: anything that is not recognizably a query or transaction
//! control statement counts as a mutation.
//!
//! # Strategy
//! - Strip comments and leading whitespace
//! - Normalize to uppercase for pattern matching
//! - Look at the leading keyword (after an optional `EXPLAIN` prefix)
//! - `WITH` is a query unless its body contains a data-changing keyword

/// Coarse kind of a SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    /// Reads data only (SELECT, VALUES, PRAGMA, SHOW, DESCRIBE, EXPLAIN)
    Query,
    /// Writes data or schema
    Mutation,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT, RELEASE
    Transaction,
}

const QUERY_KEYWORDS: &[&str] = &["SELECT", "VALUES", "PRAGMA", "SHOW", "DESCRIBE", "DESC", "TABLE"];
const TRANSACTION_KEYWORDS: &[&str] =
    &["BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE", "START"];
const WRITE_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE", "UPSERT"];

/// Classify a single SQL statement
///
/// Empty input (or input that is only comments) is treated as a query.
#[must_use]
pub fn classify(sql: &str) -> StatementClass {
    let normalized = strip_comments(sql).to_uppercase();
    let words: Vec<&str> = keywords(&normalized).collect();
    let words = strip_explain_prefix(&words);

    let Some(first) = words.first() else {
        return StatementClass::Query;
    };

    if *first == "WITH" {
        if words.iter().any(|w| WRITE_KEYWORDS.contains(w)) {
            return StatementClass::Mutation;
        }
        return StatementClass::Query;
    }
    if QUERY_KEYWORDS.contains(first) {
        return StatementClass::Query;
    }
    if TRANSACTION_KEYWORDS.contains(first) {
        return StatementClass::Transaction;
    }
    StatementClass::Mutation
}

/// Whether executing `sql` may change data or schema
#[must_use]
pub fn is_mutation(sql: &str) -> bool {
    classify(sql) == StatementClass::Mutation
}

/// Split a script into individual statements on top-level semicolons
///
/// Semicolons inside quoted strings, quoted identifiers and comments do not
/// split. Statements that are empty once comments are removed are dropped.
#[must_use]
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' | '`' => {
                current.push(ch);
                for inner in chars.by_ref() {
                    current.push(inner);
                    // A doubled quote re-enters the string on the next iteration
                    if inner == ch {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                current.push(ch);
                for inner in chars.by_ref() {
                    current.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                current.push(ch);
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    current.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(ch),
        }
    }
    push_statement(&mut statements, &mut current);

    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = std::mem::take(current);
    if !strip_comments(&statement).trim().is_empty() {
        statements.push(statement.trim().to_string());
    }
}

/// Strip SQL comments from a statement
///
/// Handles:
/// - Line comments: -- comment
/// - Block comments: /* comment */
fn strip_comments(sql: &str) -> String {
    let mut result = String::new();
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '-' if chars.peek() == Some(&'-') => {
                chars.next();
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for ch in chars.by_ref() {
                    if prev == '*' && ch == '/' {
                        break;
                    }
                    prev = ch;
                }
                result.push(' ');
            }
            _ => result.push(ch),
        }
    }

    result
}

fn keywords(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).filter(|w| !w.is_empty())
}

/// Drop `EXPLAIN`, `EXPLAIN QUERY PLAN` and `EXPLAIN ANALYZE` prefixes
fn strip_explain_prefix<'a, 'b>(words: &'b [&'a str]) -> &'b [&'a str] {
    match words {
        ["EXPLAIN", "QUERY", "PLAN", rest @ ..] | ["EXPLAIN", "ANALYZE", rest @ ..] => rest,
        ["EXPLAIN", rest @ ..] => rest,
        _ => words,
    }
}
