//! Statement classification by leading keyword.
//!
//! This is a prefix test, not a parse: comments and whitespace ahead of the
//! first keyword are skipped and case is ignored.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Read,
    Write,
    SchemaChange,
    /// Anything else (`PRAGMA`, `WITH`, `VACUUM`, ...). Runs without an
    /// explicit transaction.
    Other,
}

impl StatementClass {
    pub fn needs_transaction(self) -> bool {
        matches!(self, StatementClass::Write | StatementClass::SchemaChange)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatementClass::Read => "read",
            StatementClass::Write => "write",
            StatementClass::SchemaChange => "schema-change",
            StatementClass::Other => "other",
        }
    }
}

impl fmt::Display for StatementClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify_statement(sql: &str) -> StatementClass {
    let keyword = leading_keyword(sql);
    if keyword.eq_ignore_ascii_case("select") {
        return StatementClass::Read;
    }
    for write in ["insert", "update", "delete", "replace"] {
        if keyword.eq_ignore_ascii_case(write) {
            return StatementClass::Write;
        }
    }
    for schema in ["create", "drop", "alter"] {
        if keyword.eq_ignore_ascii_case(schema) {
            return StatementClass::SchemaChange;
        }
    }
    StatementClass::Other
}

/// Returns the first keyword of `sql`, skipping whitespace and comments.
pub fn leading_keyword(sql: &str) -> &str {
    let rest = skip_trivia(sql);
    let end = rest
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .unwrap_or(rest.len());
    &rest[..end]
}

fn skip_trivia(mut sql: &str) -> &str {
    loop {
        let trimmed = sql.trim_start();
        if let Some(comment) = trimmed.strip_prefix("--") {
            sql = comment.find('\n').map_or("", |idx| &comment[idx + 1..]);
        } else if let Some(comment) = trimmed.strip_prefix("/*") {
            sql = comment.find("*/").map_or("", |idx| &comment[idx + 2..]);
        } else {
            return trimmed;
        }
    }
}
