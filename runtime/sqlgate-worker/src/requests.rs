use serde::{Deserialize, Serialize};
use sqlgate_db::{ExecutionResult, IndexInfo, Params, ResourceDescriptor, Row};

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaRequest {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TableRequest {
    pub table_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightRequest {
    pub insight: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateFtsRequest {
    pub table_name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub content_table: Option<String>,
    #[serde(default)]
    pub tokenizer: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FtsSearchRequest {
    pub table_name: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub snippet_length: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonTextRequest {
    pub json_str: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct RowsResponse {
    pub rows: Vec<Row>,
}

/// `write_query` result. DML reports its affected-row count, `RETURNING`
/// included; statements such as `PRAGMA` hand back their rows.
#[derive(Debug, Serialize)]
pub struct WriteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
}

impl From<ExecutionResult> for WriteResponse {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Affected { affected_rows } => Self {
                affected_rows: Some(affected_rows),
                rows: None,
            },
            ExecutionResult::Rows(rows) => Self {
                affected_rows: None,
                rows: Some(rows),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TablesResponse {
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DescribeResponse {
    pub table_name: String,
    pub columns: Vec<Row>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsightResponse {
    pub message: String,
    pub insight_count: usize,
}

#[derive(Debug, Serialize)]
pub struct IndexesResponse {
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Serialize)]
pub struct ResourcesResponse {
    pub resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub uri: String,
    pub mime_type: String,
    pub text: String,
}
