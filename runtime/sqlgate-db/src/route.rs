//! Routes binary-JSON column parameters through `jsonb()`.
//!
//! Only the target table, the INSERT column list and VALUES tuples, and the
//! UPDATE SET list are inspected. A placeholder bound to a configured
//! binary-JSON column is rewritten to `jsonb(<placeholder>)` when its bound
//! value holds valid JSON; everything else is left byte-for-byte intact.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::jsonb::validate_json;
use crate::value::Params;

/// A `(table, column)` pair stored as binary JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonbColumn {
    pub table: String,
    pub column: String,
}

impl JsonbColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn memory_journal_metadata() -> Self {
        Self::new("memory_journal", "metadata")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Word(String),
    StringLit,
    Placeholder { index: usize, name: Option<String> },
    LParen,
    RParen,
    Comma,
    Eq,
    Dot,
    Semicolon,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    kind: Kind,
    start: usize,
    end: usize,
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Splits `sql` into tokens, dropping whitespace and comments. Quoted
/// identifiers come back as words with their quotes removed. Placeholders
/// carry the parameter index SQLite would assign them.
fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut named: HashMap<String, usize> = HashMap::new();
    let mut max_index = 0usize;
    let mut pos = 0usize;
    while pos < sql.len() {
        let Some(ch) = sql[pos..].chars().next() else {
            break;
        };
        let start = pos;
        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }
        if sql[pos..].starts_with("--") {
            pos = sql[pos..].find('\n').map_or(sql.len(), |idx| pos + idx + 1);
            continue;
        }
        if sql[pos..].starts_with("/*") {
            pos = sql[pos + 2..].find("*/").map_or(sql.len(), |idx| pos + 2 + idx + 2);
            continue;
        }
        let kind = match ch {
            '\'' => {
                pos = scan_quoted(bytes, pos, b'\'');
                Kind::StringLit
            }
            '"' | '`' => {
                let quote = ch as u8;
                pos = scan_quoted(bytes, pos, quote);
                let inner_end = if pos > start + 1 && bytes[pos - 1] == quote { pos - 1 } else { pos };
                let single = ch.to_string();
                Kind::Word(sql[start + 1..inner_end].replace(&single.repeat(2), &single))
            }
            '[' => {
                pos = sql[pos..].find(']').map_or(sql.len(), |idx| pos + idx + 1);
                let inner_end = if sql[..pos].ends_with(']') { pos - 1 } else { pos };
                Kind::Word(sql[start + 1..inner_end].to_string())
            }
            '?' => {
                pos += 1;
                let digits = sql[pos..]
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(sql.len() - pos);
                let index = if digits == 0 {
                    max_index + 1
                } else {
                    sql[pos..pos + digits].parse().unwrap_or(max_index + 1)
                };
                pos += digits;
                max_index = max_index.max(index);
                Kind::Placeholder { index, name: None }
            }
            ':' | '@' | '$'
                if sql[pos + 1..].chars().next().is_some_and(is_ident_char) =>
            {
                pos += 1;
                let len = sql[pos..]
                    .find(|c: char| !is_ident_char(c))
                    .unwrap_or(sql.len() - pos);
                pos += len;
                let name = sql[start..pos].to_string();
                let index = *named.entry(name.clone()).or_insert_with(|| {
                    max_index += 1;
                    max_index
                });
                Kind::Placeholder {
                    index,
                    name: Some(name),
                }
            }
            '(' => {
                pos += 1;
                Kind::LParen
            }
            ')' => {
                pos += 1;
                Kind::RParen
            }
            ',' => {
                pos += 1;
                Kind::Comma
            }
            '=' => {
                pos += 1;
                if sql[pos..].starts_with('=') {
                    pos += 1;
                }
                Kind::Eq
            }
            '.' => {
                pos += 1;
                Kind::Dot
            }
            ';' => {
                pos += 1;
                Kind::Semicolon
            }
            c if is_ident_char(c) => {
                let len = sql[pos..]
                    .find(|c: char| !is_ident_char(c))
                    .unwrap_or(sql.len() - pos);
                pos += len;
                Kind::Word(sql[start..pos].to_string())
            }
            other => {
                pos += other.len_utf8();
                Kind::Other
            }
        };
        tokens.push(Token {
            kind,
            start,
            end: pos,
        });
    }
    tokens
}

/// Returns the position just past the closing quote (doubled quotes escape).
fn scan_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    bytes.len()
}

fn word(token: Option<&Token>) -> Option<&str> {
    match token.map(|token| &token.kind) {
        Some(Kind::Word(text)) => Some(text.as_str()),
        _ => None,
    }
}

fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
    word(token).is_some_and(|text| text.eq_ignore_ascii_case(keyword))
}

/// Reads `[schema .] name` at `pos`, returning the bare name and the next position.
fn table_name(tokens: &[Token], pos: usize) -> Option<(String, usize)> {
    let first = word(tokens.get(pos))?.to_string();
    if matches!(tokens.get(pos + 1).map(|t| &t.kind), Some(Kind::Dot)) {
        let second = word(tokens.get(pos + 2))?.to_string();
        return Some((second, pos + 3));
    }
    Some((first, pos + 1))
}

/// Locates the table written to by an INSERT/REPLACE/UPDATE statement.
fn target_table(tokens: &[Token]) -> Option<(bool, String, usize)> {
    let verb = word(tokens.first())?;
    let mut pos = 1;
    let is_update = verb.eq_ignore_ascii_case("update");
    if !is_update && !verb.eq_ignore_ascii_case("insert") && !verb.eq_ignore_ascii_case("replace") {
        return None;
    }
    if is_keyword(tokens.get(pos), "or") {
        pos += 2;
    }
    if !is_update {
        if !is_keyword(tokens.get(pos), "into") {
            return None;
        }
        pos += 1;
    }
    let (table, next) = table_name(tokens, pos)?;
    Some((is_update, table, next))
}

/// Splits the tokens between an opening paren at `open` and its match into
/// top-level comma-separated groups. Returns the groups and the index past
/// the closing paren.
fn paren_groups(tokens: &[Token], open: usize) -> Option<(Vec<&[Token]>, usize)> {
    if !matches!(tokens.get(open).map(|t| &t.kind), Some(Kind::LParen)) {
        return None;
    }
    let mut depth = 0usize;
    let mut groups = Vec::new();
    let mut group_start = open + 1;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            Kind::LParen => depth += 1,
            Kind::RParen => {
                depth -= 1;
                if depth == 0 {
                    groups.push(&tokens[group_start..idx]);
                    return Some((groups, idx + 1));
                }
            }
            Kind::Comma if depth == 1 => {
                groups.push(&tokens[group_start..idx]);
                group_start = idx + 1;
            }
            _ => {}
        }
    }
    None
}

fn single_placeholder(group: &[Token]) -> Option<&Token> {
    match group {
        [token] if matches!(token.kind, Kind::Placeholder { .. }) => Some(token),
        _ => None,
    }
}

fn insert_targets<'t>(tokens: &'t [Token], mut pos: usize, columns: &[&str]) -> Vec<&'t Token> {
    let mut found = Vec::new();
    if is_keyword(tokens.get(pos), "as") {
        pos += 2;
    }
    let Some((names, mut pos)) = paren_groups(tokens, pos) else {
        return found;
    };
    let positions: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, group)| match group {
            [token] => word(Some(token))
                .is_some_and(|name| columns.iter().any(|c| c.eq_ignore_ascii_case(name))),
            _ => false,
        })
        .map(|(idx, _)| idx)
        .collect();
    if positions.is_empty() || !is_keyword(tokens.get(pos), "values") {
        return found;
    }
    pos += 1;
    while let Some((items, next)) = paren_groups(tokens, pos) {
        if items.len() == names.len() {
            for &column_pos in &positions {
                if let Some(token) = single_placeholder(items[column_pos]) {
                    found.push(token);
                }
            }
        }
        if !matches!(tokens.get(next).map(|t| &t.kind), Some(Kind::Comma)) {
            break;
        }
        pos = next + 1;
    }
    found
}

fn update_targets<'t>(tokens: &'t [Token], pos: usize, columns: &[&str]) -> Vec<&'t Token> {
    let mut found = Vec::new();
    let Some(set) = tokens[pos..]
        .iter()
        .position(|token| is_keyword(Some(token), "set"))
        .map(|idx| pos + idx)
    else {
        return found;
    };
    let mut depth = 0usize;
    let mut idx = set + 1;
    while idx < tokens.len() {
        match &tokens[idx].kind {
            Kind::LParen => depth += 1,
            Kind::RParen => depth = depth.saturating_sub(1),
            Kind::Word(text)
                if depth == 0
                    && ["where", "from", "returning"]
                        .iter()
                        .any(|kw| text.eq_ignore_ascii_case(kw)) =>
            {
                break;
            }
            Kind::Semicolon => break,
            Kind::Eq if depth == 0 => {
                let is_target = word(idx.checked_sub(1).and_then(|prev| tokens.get(prev)))
                    .is_some_and(|name| columns.iter().any(|c| c.eq_ignore_ascii_case(name)));
                let rhs = tokens.get(idx + 1);
                let rhs_ends = matches!(
                    tokens.get(idx + 2).map(|t| &t.kind),
                    None | Some(Kind::Comma) | Some(Kind::Semicolon) | Some(Kind::Word(_))
                );
                if is_target && rhs_ends {
                    if let Some(token) = rhs.filter(|t| matches!(t.kind, Kind::Placeholder { .. })) {
                        found.push(token);
                    }
                }
            }
            _ => {}
        }
        idx += 1;
    }
    found
}

fn routable(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(text) => validate_json(text).is_ok(),
        JsonValue::Object(_) | JsonValue::Array(_) => true,
        _ => false,
    }
}

/// Rewrites placeholders feeding a binary-JSON column so their values are
/// stored through `jsonb()`. Returns the statement unchanged when nothing
/// qualifies.
pub fn route_jsonb_params<'a>(
    sql: &'a str,
    params: &Params,
    columns: &[JsonbColumn],
) -> Cow<'a, str> {
    if params.is_empty() || columns.is_empty() {
        return Cow::Borrowed(sql);
    }
    let tokens = tokenize(sql);
    let Some((is_update, table, pos)) = target_table(&tokens) else {
        return Cow::Borrowed(sql);
    };
    let wanted: Vec<&str> = columns
        .iter()
        .filter(|c| c.table.eq_ignore_ascii_case(&table))
        .map(|c| c.column.as_str())
        .collect();
    if wanted.is_empty() {
        return Cow::Borrowed(sql);
    }
    let candidates = if is_update {
        update_targets(&tokens, pos, &wanted)
    } else {
        insert_targets(&tokens, pos, &wanted)
    };

    let mut spans: Vec<(usize, usize)> = Vec::new();
    for token in candidates {
        let Kind::Placeholder { index, name } = &token.kind else {
            continue;
        };
        match params.lookup(*index, name.as_deref()) {
            Some(value) if routable(value) => spans.push((token.start, token.end)),
            Some(JsonValue::String(_)) => {
                let placeholder = &sql[token.start..token.end];
                tracing::warn!(
                    table = %table,
                    placeholder,
                    "binary-JSON parameter is not valid JSON; storing raw value"
                );
            }
            _ => {}
        }
    }
    if spans.is_empty() {
        return Cow::Borrowed(sql);
    }
    spans.sort_unstable();
    spans.dedup();
    let mut rewritten = String::with_capacity(sql.len() + spans.len() * 7);
    let mut cursor = 0;
    for (start, end) in spans {
        rewritten.push_str(&sql[cursor..start]);
        rewritten.push_str("jsonb(");
        rewritten.push_str(&sql[start..end]);
        rewritten.push(')');
        cursor = end;
    }
    rewritten.push_str(&sql[cursor..]);
    Cow::Owned(rewritten)
}
