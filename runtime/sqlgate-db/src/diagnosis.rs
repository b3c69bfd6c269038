//! Turns raw engine errors into a categorized diagnosis with remediation hints.
//!
//! Classification is a pure function of the engine error code, the engine's
//! own message and the statement. Rules are checked in order and the first
//! match wins; every input yields a diagnosis.

use std::fmt;

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};

/// Statements longer than this are cut before they are attached to a diagnosis.
pub const MAX_CONTEXT_STATEMENT: usize = 200;
/// Bytes of statement text kept on each side of a reported error offset.
pub const FRAGMENT_RADIUS: usize = 20;

const LOCKED_MESSAGES: [&str; 3] = [
    "database is locked",
    "database table is locked",
    "database schema is locked",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    InvalidJson,
    JsonPathInvalid,
    JsonTypeMismatch,
    ConstraintViolation,
    SyntaxError,
    Locked,
    Unclassified,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::InvalidJson => "InvalidJson",
            ErrorCategory::JsonPathInvalid => "JsonPathInvalid",
            ErrorCategory::JsonTypeMismatch => "JsonTypeMismatch",
            ErrorCategory::ConstraintViolation => "ConstraintViolation",
            ErrorCategory::SyntaxError => "SyntaxError",
            ErrorCategory::Locked => "Locked",
            ErrorCategory::Unclassified => "Unclassified",
        }
    }

    pub fn is_json_related(self) -> bool {
        matches!(
            self,
            ErrorCategory::InvalidJson
                | ErrorCategory::JsonPathInvalid
                | ErrorCategory::JsonTypeMismatch
        )
    }

    /// Contention is the only category worth retrying unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Locked)
    }

    fn explanation(self) -> &'static str {
        match self {
            ErrorCategory::InvalidJson => "a value passed to a JSON function is not well-formed JSON",
            ErrorCategory::JsonPathInvalid => "a JSON path expression could not be parsed",
            ErrorCategory::JsonTypeMismatch => {
                "a JSON function was applied to a value that is not valid binary JSON"
            }
            ErrorCategory::ConstraintViolation => "the statement violates a table constraint",
            ErrorCategory::SyntaxError => "the statement could not be parsed",
            ErrorCategory::Locked => "the database is locked by another connection",
            ErrorCategory::Unclassified => "the engine reported an error",
        }
    }

    fn suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorCategory::InvalidJson => &[
                "Validate JSON before insertion; check for trailing commas or unescaped quotes",
                "Use double quotes for JSON keys and string values",
            ],
            ErrorCategory::JsonPathInvalid => &[
                "JSON paths must start with '$', for example '$.key' or '$.items[0]'",
                "Quote object keys containing special characters: '$.\"my key\"'",
            ],
            ErrorCategory::JsonTypeMismatch => &[
                "The stored value is not valid binary JSON; re-encode it with jsonb() or convert it with json()",
                "Check that the column holds JSON written through jsonb() rather than raw bytes",
            ],
            ErrorCategory::ConstraintViolation => &[
                "Check for duplicate keys, missing parent rows, or NULL values in required columns",
            ],
            ErrorCategory::SyntaxError => &[
                "Check the statement near the reported position for typos or missing punctuation",
            ],
            ErrorCategory::Locked => &[
                "Another connection holds the lock; retry the operation after a short delay",
            ],
            ErrorCategory::Unclassified => &[],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Other,
}

impl ConstraintKind {
    /// `message` is the lowercased engine text, which names the constraint
    /// type before any table or column.
    fn from_message(message: &str) -> Self {
        if message.starts_with("unique constraint failed") {
            ConstraintKind::Unique
        } else if message.starts_with("foreign key constraint failed") {
            ConstraintKind::ForeignKey
        } else if message.starts_with("not null constraint failed") {
            ConstraintKind::NotNull
        } else if message.starts_with("check constraint failed") {
            ConstraintKind::Check
        } else {
            ConstraintKind::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub statement: String,
    pub has_params: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

impl ErrorContext {
    fn new(sql: &str, has_params: bool, offset: Option<usize>) -> Self {
        let offset = offset.filter(|offset| *offset <= sql.len());
        Self {
            statement: truncate_statement(sql),
            has_params,
            offset,
            fragment: offset.map(|offset| fragment_around(sql, offset)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<ConstraintKind>,
    pub explanation: String,
    pub context: ErrorContext,
    pub suggestions: Vec<String>,
    pub is_json_related: bool,
    pub retryable: bool,
}

impl Diagnosis {
    fn new(category: ErrorCategory, constraint: Option<ConstraintKind>, context: ErrorContext) -> Self {
        Self {
            category,
            constraint,
            explanation: category.explanation().to_string(),
            context,
            suggestions: category.suggestions().iter().map(|s| s.to_string()).collect(),
            is_json_related: category.is_json_related(),
            retryable: category.is_retryable(),
        }
    }

    /// Caller-facing text for `raw`. JSON-related failures carry their first
    /// suggestion.
    pub fn user_message(&self, raw: &str) -> String {
        match self.suggestions.first() {
            Some(first) if self.is_json_related => {
                format!("Database error: {raw}\nSuggestion: {first}")
            }
            _ => format!("Database error: {raw}"),
        }
    }
}

/// Classifies engine errors. Knows which columns hold binary JSON so a
/// malformed-JSON report over one of them reads as a type mismatch.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    binary_columns: Vec<String>,
}

impl ErrorClassifier {
    pub fn new<I, S>(binary_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            binary_columns: binary_columns
                .into_iter()
                .map(|column| column.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn classify(&self, err: &rusqlite::Error, sql: &str, has_params: bool) -> Diagnosis {
        match err {
            rusqlite::Error::SqliteFailure(failure, Some(message)) => {
                self.classify_parts(Some(failure.code), message, None, sql, has_params)
            }
            rusqlite::Error::SqlInputError {
                error, msg, offset, ..
            } => self.classify_parts(
                Some(error.code),
                msg,
                usize::try_from(*offset).ok(),
                sql,
                has_params,
            ),
            other => {
                let message = other.to_string();
                let offset = error_offset(&message);
                self.classify_parts(other.sqlite_error_code(), &message, offset, sql, has_params)
            }
        }
    }

    /// Classifies already-rendered error text. A trailing `at offset N` is
    /// picked up as the error position.
    pub fn classify_message(
        &self,
        code: Option<ErrorCode>,
        message: &str,
        sql: &str,
        has_params: bool,
    ) -> Diagnosis {
        self.classify_parts(code, message, error_offset(message), sql, has_params)
    }

    // Engine messages quote user identifiers after a fixed lead-in, so text
    // rules only look at that lead-in. Contention is decided by code whenever
    // one is available.
    fn classify_parts(
        &self,
        code: Option<ErrorCode>,
        message: &str,
        offset: Option<usize>,
        sql: &str,
        has_params: bool,
    ) -> Diagnosis {
        let context = ErrorContext::new(sql, has_params, offset);
        let lower = message.trim_start().to_ascii_lowercase();
        let blob_in_json = lower.starts_with("json cannot hold blob");
        let malformed = lower.starts_with("malformed json") || lower.starts_with("invalid json");

        if malformed && !blob_in_json && !self.reads_binary_column(sql) {
            return Diagnosis::new(ErrorCategory::InvalidJson, None, context);
        }
        if lower.starts_with("bad json path") || lower.starts_with("json path error") {
            return Diagnosis::new(ErrorCategory::JsonPathInvalid, None, context);
        }
        if malformed || blob_in_json {
            return Diagnosis::new(ErrorCategory::JsonTypeMismatch, None, context);
        }
        if code == Some(ErrorCode::ConstraintViolation)
            || (code.is_none() && lower.contains(" constraint failed"))
        {
            let kind = ConstraintKind::from_message(&lower);
            return Diagnosis::new(ErrorCategory::ConstraintViolation, Some(kind), context);
        }
        if (lower.starts_with("near ") && lower.contains(": syntax error"))
            || lower.starts_with("incomplete input")
            || lower.starts_with("unrecognized token")
        {
            return Diagnosis::new(ErrorCategory::SyntaxError, None, context);
        }
        let locked = match code {
            Some(code) => matches!(code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked),
            None => LOCKED_MESSAGES.iter().any(|lead| lower.starts_with(lead)),
        };
        if locked {
            return Diagnosis::new(ErrorCategory::Locked, None, context);
        }
        Diagnosis::new(ErrorCategory::Unclassified, None, context)
    }

    /// True when `sql` calls a `jsonb` function, or applies a JSON function or
    /// arrow operator directly to one of the binary-JSON columns.
    fn reads_binary_column(&self, sql: &str) -> bool {
        let sql = sql.to_ascii_lowercase();
        let is_ident = |ch: char| ch.is_alphanumeric() || ch == '_';
        let is_binary = |operand: &str| {
            let name = operand.rsplit('.').next().unwrap_or(operand);
            let name = name.trim_matches(['"', '`', '[', ']']);
            self.binary_columns.iter().any(|column| column == name)
        };

        let mut search = 0;
        while let Some(found) = sql[search..].find("json") {
            let start = search + found;
            search = start + 4;
            if sql[..start].chars().next_back().is_some_and(is_ident) {
                continue;
            }
            let rest = &sql[start..];
            let name_end = rest.find(|ch: char| !is_ident(ch)).unwrap_or(rest.len());
            let Some(args) = rest[name_end..].trim_start().strip_prefix('(') else {
                continue;
            };
            if rest[..name_end].starts_with("jsonb") {
                return true;
            }
            let end = args.find([',', ')']).unwrap_or(args.len());
            if is_binary(args[..end].trim()) {
                return true;
            }
        }

        let mut search = 0;
        while let Some(found) = sql[search..].find("->") {
            let arrow = search + found;
            search = arrow + 2;
            let before = sql[..arrow].trim_end();
            let operand_start = before
                .char_indices()
                .rev()
                .find(|&(_, ch)| !(is_ident(ch) || matches!(ch, '.' | '"' | '`' | '[' | ']')))
                .map_or(0, |(idx, ch)| idx + ch.len_utf8());
            if is_binary(&before[operand_start..]) {
                return true;
            }
        }
        false
    }
}

pub(crate) fn truncate_statement(sql: &str) -> String {
    if sql.len() <= MAX_CONTEXT_STATEMENT {
        return sql.to_string();
    }
    let mut end = MAX_CONTEXT_STATEMENT;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}

/// Parses the engine's `at offset N` suffix.
fn error_offset(message: &str) -> Option<usize> {
    let (_, tail) = message.rsplit_once("at offset ")?;
    let digits = tail
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(tail.len());
    tail[..digits].parse().ok()
}

fn fragment_around(sql: &str, offset: usize) -> String {
    let mut start = offset.saturating_sub(FRAGMENT_RADIUS);
    while !sql.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (offset + FRAGMENT_RADIUS).min(sql.len());
    while !sql.is_char_boundary(end) {
        end += 1;
    }
    sql[start..end].to_string()
}
