//! Query execution core for the SQLite gateway.
//!
//! [`Executor`] runs statements against a pooled SQLite database. Writes and
//! schema changes are transactional, parameters feeding binary-JSON columns
//! are stored through `jsonb()`, and engine failures come back as
//! [`ExecutionError`]s carrying a [`Diagnosis`].

mod admin;
mod capabilities;
mod diagnosis;
mod error;
mod executor;
mod fts;
mod insights;
pub mod jsonb;
mod pool;
mod route;
pub mod schema;
mod sqlite;
mod statement;
mod value;

pub use admin::{
    DatabaseStats, IndexInfo, IntegrityReport, JSON_DIAGNOSTICS_URI, JsonValidation, JsonbConversion,
};
pub use capabilities::{Capabilities, JSONB_MIN_VERSION, ResourceDescriptor, ToolDescriptor};
pub use diagnosis::{
    ConstraintKind, Diagnosis, ErrorCategory, ErrorClassifier, ErrorContext, FRAGMENT_RADIUS,
    MAX_CONTEXT_STATEMENT,
};
pub use error::{ExecutionError, OpenError};
pub use executor::{
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_DB_PATH, DEFAULT_POOL_SIZE, Executor, ExecutorConfig,
    ResourceObserver,
};
pub use fts::{
    ALLOWED_TOKENIZERS, DEFAULT_SEARCH_LIMIT, DEFAULT_SNIPPET_TOKENS, DEFAULT_TOKENIZER,
    MAX_SEARCH_LIMIT, MAX_SNIPPET_TOKENS, SearchIndexCreated, SearchResults,
};
pub use insights::{INSIGHTS_MEMO_URI, InsightLedger};
pub use pool::{AcquireError, Pool, Pooled};
pub use route::{JsonbColumn, route_jsonb_params};
pub use schema::{ColumnCheck, ColumnMigrationState, MigrationOutcome, NotApplicable};
pub use sqlite::{
    DEFAULT_BUSY_TIMEOUT_MS, MEMORY_PATH, SqliteConn, SqliteOpenMode, is_memory_path, sqlite_pool,
};
pub use statement::{StatementClass, classify_statement};
pub use value::{CellValue, ExecutionResult, Params, Row};
