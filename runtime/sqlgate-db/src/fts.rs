//! FTS5 full-text index operations.

use serde::Serialize;

use crate::error::ExecutionError;
use crate::executor::Executor;
use crate::schema::quote_ident;
use crate::value::{Params, Row};

pub const DEFAULT_TOKENIZER: &str = "unicode61";
pub const ALLOWED_TOKENIZERS: [&str; 4] = ["unicode61", "porter", "ascii", "trigram"];

pub const DEFAULT_SEARCH_LIMIT: i64 = 10;
pub const MAX_SEARCH_LIMIT: i64 = 1000;
pub const DEFAULT_SNIPPET_TOKENS: i64 = 32;
/// FTS5 refuses snippets longer than this many tokens.
pub const MAX_SNIPPET_TOKENS: i64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchIndexCreated {
    pub table: String,
    pub columns: Vec<String>,
    pub tokenizer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub populated_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub populated_rows: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub results_count: usize,
    pub results: Vec<Row>,
}

fn validate_tokenizer(tokenizer: Option<&str>) -> Result<String, ExecutionError> {
    let tokenizer = tokenizer.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TOKENIZER);
    for word in tokenizer.split_whitespace() {
        if !ALLOWED_TOKENIZERS.iter().any(|allowed| word.eq_ignore_ascii_case(allowed)) {
            return Err(ExecutionError::InvalidInput(format!(
                "Unsupported tokenizer '{word}' (expected one of {})",
                ALLOWED_TOKENIZERS.join(", ")
            )));
        }
    }
    Ok(tokenizer.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn require_name<'a>(value: &'a str, what: &str) -> Result<&'a str, ExecutionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ExecutionError::InvalidInput(format!("{what} must not be empty")));
    }
    Ok(trimmed)
}

impl Executor {
    /// Creates an FTS5 table over `columns`, optionally filled from
    /// `source_table`. Creation and population are separate statements, each
    /// in its own transaction.
    pub fn create_search_index(
        &self,
        table: &str,
        columns: &[String],
        source_table: Option<&str>,
        tokenizer: Option<&str>,
    ) -> Result<SearchIndexCreated, ExecutionError> {
        let table = require_name(table, "table name")?;
        if columns.is_empty() {
            return Err(ExecutionError::InvalidInput(
                "at least one column is required".to_string(),
            ));
        }
        let columns = columns
            .iter()
            .map(|column| require_name(column, "column name").map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;
        let tokenizer = validate_tokenizer(tokenizer)?;
        let column_list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");

        self.create_schema(&format!(
            "CREATE VIRTUAL TABLE {} USING fts5({column_list}, tokenize = '{tokenizer}')",
            quote_ident(table)
        ))?;
        tracing::info!(table, tokenizer = %tokenizer, "created FTS5 table");

        let mut created = SearchIndexCreated {
            table: table.to_string(),
            columns,
            tokenizer,
            populated_from: None,
            populated_rows: None,
        };
        if let Some(source) = source_table.map(str::trim).filter(|s| !s.is_empty()) {
            let inserted = self.write(
                &format!(
                    "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {}",
                    quote_ident(table),
                    quote_ident(source)
                ),
                &Params::None,
            )?;
            created.populated_from = Some(source.to_string());
            created.populated_rows = inserted.affected_rows();
            tracing::info!(table, source, rows = ?created.populated_rows, "populated FTS5 table");
        }
        Ok(created)
    }

    pub fn rebuild_search_index(&self, table: &str) -> Result<(), ExecutionError> {
        let quoted = quote_ident(require_name(table, "table name")?);
        self.write(
            &format!("INSERT INTO {quoted}({quoted}) VALUES('rebuild')"),
            &Params::None,
        )?;
        tracing::info!(table, "rebuilt FTS5 index");
        Ok(())
    }

    /// Ranked FTS5 search. The query and limit are bound; the snippet length
    /// is a clamped integer.
    pub fn search(
        &self,
        table: &str,
        query: &str,
        limit: Option<i64>,
        snippet_length: Option<i64>,
    ) -> Result<SearchResults, ExecutionError> {
        let quoted = quote_ident(require_name(table, "table name")?);
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
        let tokens = snippet_length
            .unwrap_or(DEFAULT_SNIPPET_TOKENS)
            .clamp(1, MAX_SNIPPET_TOKENS);
        let sql = format!(
            "SELECT *, bm25({quoted}) AS rank, \
             snippet({quoted}, -1, '<mark>', '</mark>', '...', {tokens}) AS snippet \
             FROM {quoted} WHERE {quoted} MATCH ?1 ORDER BY rank LIMIT ?2"
        );
        let results = self.read(&sql, &Params::Positional(vec![query.into(), limit.into()]))?;
        tracing::debug!(table, hits = results.len(), "FTS5 search");
        Ok(SearchResults {
            query: query.to_string(),
            results_count: results.len(),
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_allowlist() {
        assert_eq!(validate_tokenizer(None).expect("default"), "unicode61");
        assert_eq!(validate_tokenizer(Some("  ")).expect("blank"), "unicode61");
        assert_eq!(validate_tokenizer(Some("porter  unicode61")).expect("combo"), "porter unicode61");
        assert!(validate_tokenizer(Some("unicode61'); DROP TABLE t; --")).is_err());
        assert!(validate_tokenizer(Some("icu")).is_err());
    }
}
