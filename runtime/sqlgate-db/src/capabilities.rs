//! Engine capabilities and the operation list derived from them.
//!
//! Both are computed once when an executor opens and then handed out as
//! plain data.

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::admin::JSON_DIAGNOSTICS_URI;
use crate::insights::INSIGHTS_MEMO_URI;

/// First engine release with the binary JSON functions (3.45.0).
pub const JSONB_MIN_VERSION: i32 = 3_045_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub sqlite_version: String,
    pub version_number: i32,
    pub jsonb_supported: bool,
    pub jsonb_enabled: bool,
    pub fts5: bool,
}

impl Capabilities {
    pub fn probe(conn: &Connection, jsonb_enabled: bool) -> rusqlite::Result<Self> {
        let version_number = rusqlite::version_number();
        let fts5: bool = conn.query_row(
            "SELECT sqlite_compileoption_used('ENABLE_FTS5')",
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            sqlite_version: rusqlite::version().to_string(),
            version_number,
            jsonb_supported: version_number >= JSONB_MIN_VERSION,
            jsonb_enabled,
            fts5,
        })
    }

    /// Binary JSON is used only when the engine supports it and it is enabled.
    pub fn jsonb_active(&self) -> bool {
        self.jsonb_supported && self.jsonb_enabled
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = vec![
            ToolDescriptor::new(
                "read_query",
                "Execute a SELECT query on the SQLite database",
                query_schema("SELECT SQL query to execute", true),
            ),
            ToolDescriptor::new(
                "write_query",
                "Execute an INSERT, UPDATE, or DELETE query on the SQLite database",
                query_schema("SQL query to execute", true),
            ),
            ToolDescriptor::new(
                "create_table",
                "Create a new table in the SQLite database",
                query_schema("CREATE TABLE SQL statement", false),
            ),
            ToolDescriptor::new("list_tables", "List all tables in the SQLite database", empty_schema()),
            ToolDescriptor::new(
                "describe_table",
                "Get the schema information for a specific table",
                string_schema("table_name", "Name of the table to describe"),
            ),
            ToolDescriptor::new(
                "append_insight",
                "Add a business insight to the memo",
                string_schema("insight", "Business insight discovered from data analysis"),
            ),
            ToolDescriptor::new(
                "vacuum_database",
                "Optimize database by reclaiming unused space and defragmenting",
                empty_schema(),
            ),
            ToolDescriptor::new(
                "analyze_database",
                "Update database statistics for query optimization",
                empty_schema(),
            ),
            ToolDescriptor::new(
                "integrity_check",
                "Check database integrity and report any corruption",
                empty_schema(),
            ),
            ToolDescriptor::new(
                "database_stats",
                "Get database performance and usage statistics",
                empty_schema(),
            ),
            ToolDescriptor::new(
                "index_usage_stats",
                "Get index usage statistics for query optimization",
                empty_schema(),
            ),
        ];
        if self.fts5 {
            tools.extend([
                ToolDescriptor::new(
                    "create_fts_table",
                    "Create a FTS5 virtual table for full-text search",
                    json!({
                        "type": "object",
                        "properties": {
                            "table_name": {"type": "string", "description": "Name for the FTS5 table"},
                            "columns": {"type": "array", "items": {"type": "string"}, "description": "Columns to include in the FTS5 index"},
                            "content_table": {"type": "string", "description": "Optional source table to populate from"},
                            "tokenizer": {"type": "string", "description": "Tokenizer (unicode61, porter, ascii, trigram)", "default": "unicode61"}
                        },
                        "required": ["table_name", "columns"]
                    }),
                ),
                ToolDescriptor::new(
                    "rebuild_fts_index",
                    "Rebuild FTS5 index for optimal performance",
                    string_schema("table_name", "Name of the FTS5 table to rebuild"),
                ),
                ToolDescriptor::new(
                    "fts_search",
                    "Perform enhanced full-text search with ranking and snippets",
                    json!({
                        "type": "object",
                        "properties": {
                            "table_name": {"type": "string", "description": "Name of the FTS5 table to search"},
                            "query": {"type": "string", "description": "FTS5 search query"},
                            "limit": {"type": "integer", "description": "Maximum number of results", "default": 10},
                            "snippet_length": {"type": "integer", "description": "Tokens per snippet", "default": 32}
                        },
                        "required": ["table_name", "query"]
                    }),
                ),
            ]);
        }
        if self.jsonb_supported {
            tools.extend([
                ToolDescriptor::new(
                    "validate_json",
                    "Validate a JSON string and provide detailed feedback",
                    string_schema("json_str", "JSON string to validate"),
                ),
                ToolDescriptor::new(
                    "test_jsonb_conversion",
                    "Test conversion of a JSON string to JSONB format and back",
                    string_schema("json_str", "JSON string to convert"),
                ),
            ]);
        }
        tools
    }
}

/// Readable documents; both are always present.
pub fn resources() -> Vec<ResourceDescriptor> {
    vec![
        ResourceDescriptor {
            uri: INSIGHTS_MEMO_URI,
            name: "Business Insights Memo",
            description: "A living document of discovered business insights",
            mime_type: "text/plain",
        },
        ResourceDescriptor {
            uri: JSON_DIAGNOSTICS_URI,
            name: "JSON Diagnostics",
            description: "Diagnostic information about JSON handling capabilities",
            mime_type: "application/json",
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub uri: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: JsonValue,
}

impl ToolDescriptor {
    fn new(name: &'static str, description: &'static str, input_schema: JsonValue) -> Self {
        Self {
            name,
            description,
            input_schema,
        }
    }
}

fn empty_schema() -> JsonValue {
    json!({"type": "object", "properties": {}})
}

fn string_schema(field: &str, description: &str) -> JsonValue {
    json!({
        "type": "object",
        "properties": {field: {"type": "string", "description": description}},
        "required": [field]
    })
}

fn query_schema(description: &str, with_params: bool) -> JsonValue {
    let mut schema = string_schema("query", description);
    if with_params {
        schema["properties"]["params"] = json!({
            "type": ["array", "object"],
            "description": "Optional positional or named parameters"
        });
    }
    schema
}
