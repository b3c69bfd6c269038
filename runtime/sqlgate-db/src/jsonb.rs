//! Binary-JSON codec.
//!
//! Both directions delegate to the engine's `jsonb()` / `json()` functions.
//! `encode` syntax-checks its input first so malformed text never reaches the
//! engine.

use rusqlite::Connection;
use serde::de::IgnoredAny;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("value is not valid binary JSON: {0}")]
    Decode(String),
    #[error("binary JSON encoding failed: {0}")]
    Engine(#[source] rusqlite::Error),
}

/// Checks `text` for JSON syntax, returning the parser's message on failure.
pub fn validate_json(text: &str) -> Result<(), String> {
    serde_json::from_str::<IgnoredAny>(text)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

pub fn encode(conn: &Connection, json_text: &str) -> Result<Vec<u8>, CodecError> {
    validate_json(json_text).map_err(CodecError::InvalidJson)?;
    conn.query_row("SELECT jsonb(?1)", [json_text], |row| row.get::<_, Vec<u8>>(0))
        .map_err(CodecError::Engine)
}

pub fn decode(conn: &Connection, binary: &[u8]) -> Result<String, CodecError> {
    conn.query_row("SELECT json(?1)", [binary], |row| row.get::<_, String>(0))
        .map_err(|err| CodecError::Decode(err.to_string()))
}

/// Decodes `binary` and parses the resulting text.
pub fn decode_value(conn: &Connection, binary: &[u8]) -> Result<serde_json::Value, CodecError> {
    let text = decode(conn, binary)?;
    serde_json::from_str(&text).map_err(|err| CodecError::Decode(err.to_string()))
}
