//! Maintenance, statistics and JSON diagnostic operations.

use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::error::ExecutionError;
use crate::executor::Executor;
use crate::insights::INSIGHTS_MEMO_URI;
use crate::jsonb::{self, CodecError};
use crate::value::{CellValue, Params, Row};

pub const JSON_DIAGNOSTICS_URI: &str = "diagnostics://json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub page_count: i64,
    pub page_size: i64,
    pub database_size_bytes: i64,
    pub database_size_mb: f64,
    pub table_count: i64,
    pub index_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub tbl_name: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonValidation {
    pub valid: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonbConversion {
    pub valid: bool,
    pub conversion_successful: bool,
    pub binary_bytes: usize,
    pub roundtrip_equal: bool,
    pub message: String,
}

fn text_column(row: &Row, column: &str) -> String {
    row.get(column)
        .and_then(CellValue::as_str)
        .unwrap_or_default()
        .to_string()
}

impl Executor {
    fn scalar_i64(&self, sql: &str) -> Result<i64, ExecutionError> {
        let result = self.execute(sql, &Params::None)?;
        Ok(result
            .rows()
            .first()
            .and_then(|row| row.iter().next())
            .and_then(|(_, value)| value.as_i64())
            .unwrap_or_default())
    }

    /// Runs VACUUM. It cannot run inside a transaction, so it goes through
    /// the untransacted path.
    pub fn vacuum(&self) -> Result<(), ExecutionError> {
        tracing::info!("running VACUUM");
        self.execute("VACUUM", &Params::None)?;
        Ok(())
    }

    pub fn analyze(&self) -> Result<(), ExecutionError> {
        tracing::info!("running ANALYZE");
        self.execute("ANALYZE", &Params::None)?;
        Ok(())
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport, ExecutionError> {
        let rows = self.execute("PRAGMA integrity_check", &Params::None)?.into_rows();
        let messages: Vec<String> = rows
            .iter()
            .map(|row| text_column(row, "integrity_check"))
            .collect();
        let ok = messages.len() == 1 && messages[0] == "ok";
        if !ok {
            tracing::warn!(problems = messages.len(), "integrity check reported problems");
        }
        Ok(IntegrityReport { ok, messages })
    }

    pub fn database_stats(&self) -> Result<DatabaseStats, ExecutionError> {
        let page_count = self.scalar_i64("PRAGMA page_count")?;
        let page_size = self.scalar_i64("PRAGMA page_size")?;
        let table_count = self.scalar_i64("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")?;
        let index_count = self.scalar_i64("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'")?;
        let database_size_bytes = page_count * page_size;
        let database_size_mb = (database_size_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
        Ok(DatabaseStats {
            page_count,
            page_size,
            database_size_bytes,
            database_size_mb,
            table_count,
            index_count,
        })
    }

    /// Explicit indexes (automatic ones carry no SQL), ordered by table then name.
    pub fn index_usage_stats(&self) -> Result<Vec<IndexInfo>, ExecutionError> {
        let rows = self.read(
            "SELECT name, tbl_name, sql FROM sqlite_master \
             WHERE type = 'index' AND sql IS NOT NULL ORDER BY tbl_name, name",
            &Params::None,
        )?;
        Ok(rows
            .iter()
            .map(|row| IndexInfo {
                name: text_column(row, "name"),
                tbl_name: text_column(row, "tbl_name"),
                sql: text_column(row, "sql"),
            })
            .collect())
    }

    pub fn validate_json(&self, text: &str) -> JsonValidation {
        match serde_json::from_str::<JsonValue>(text) {
            Ok(parsed) => JsonValidation {
                valid: true,
                message: "JSON is valid".to_string(),
                error: None,
                parsed: Some(parsed),
            },
            Err(err) => JsonValidation {
                valid: false,
                message: format!("JSON is invalid: {err}"),
                error: Some(err.to_string()),
                parsed: None,
            },
        }
    }

    /// Encodes `text` to binary JSON and back through the engine.
    pub fn test_jsonb_conversion(&self, text: &str) -> Result<JsonbConversion, ExecutionError> {
        if !self.capabilities().jsonb_supported {
            return Err(ExecutionError::InvalidInput(format!(
                "binary JSON requires SQLite 3.45.0 or newer (running {})",
                self.capabilities().sqlite_version
            )));
        }
        let failed = |message: String| JsonbConversion {
            valid: false,
            conversion_successful: false,
            binary_bytes: 0,
            roundtrip_equal: false,
            message,
        };
        let conn = self.pool().acquire(self.config().acquire_timeout)?;
        let conn = conn.as_ref().connection();
        let binary = match jsonb::encode(conn, text) {
            Ok(binary) => binary,
            Err(CodecError::InvalidJson(err)) => return Ok(failed(format!("JSON is invalid: {err}"))),
            Err(CodecError::Engine(err)) => return Err(self.engine_error(err, "SELECT jsonb(?1)", true)),
            Err(err) => return Ok(failed(err.to_string())),
        };
        let decoded = match jsonb::decode(conn, &binary) {
            Ok(decoded) => decoded,
            Err(err) => return Ok(failed(format!("JSONB conversion failed: {err}"))),
        };
        let original: JsonValue = serde_json::from_str(text).unwrap_or(JsonValue::Null);
        let roundtrip: JsonValue = serde_json::from_str(&decoded).unwrap_or(JsonValue::Null);
        let roundtrip_equal = original == roundtrip;
        Ok(JsonbConversion {
            valid: true,
            conversion_successful: roundtrip_equal,
            binary_bytes: binary.len(),
            roundtrip_equal,
            message: if roundtrip_equal {
                "JSONB conversion test successful".to_string()
            } else {
                "JSONB roundtrip changed the value".to_string()
            },
        })
    }

    pub fn json_diagnostics(&self) -> JsonValue {
        let caps = self.capabilities();
        let columns: Vec<JsonValue> = self
            .migration_states()
            .iter()
            .map(|(column, state)| {
                json!({
                    "table": column.table,
                    "column": column.column,
                    "state": state,
                })
            })
            .collect();
        json!({
            "sqlite_version": caps.sqlite_version,
            "jsonb_support": caps.jsonb_supported,
            "jsonb_enabled": caps.jsonb_enabled,
            "validation_available": true,
            "conversion_available": caps.jsonb_active(),
            "binary_json_columns": columns,
            "status": "operational",
        })
    }

    /// Renders `memo://insights` or `diagnostics://json`.
    pub fn read_resource(&self, uri: &str) -> Result<String, ExecutionError> {
        match uri {
            INSIGHTS_MEMO_URI => Ok(self.insights_memo()),
            JSON_DIAGNOSTICS_URI => serde_json::to_string_pretty(&self.json_diagnostics())
                .map_err(|err| ExecutionError::InvalidInput(err.to_string())),
            other => match other.split_once("://") {
                Some((scheme @ ("memo" | "diagnostics"), path)) => Err(ExecutionError::InvalidInput(
                    format!("Unknown {scheme} path: {path}"),
                )),
                Some((scheme, _)) => Err(ExecutionError::InvalidInput(format!(
                    "Unsupported URI scheme: {scheme}"
                ))),
                None => Err(ExecutionError::InvalidInput(format!("Invalid resource URI: {other}"))),
            },
        }
    }
}
