//! The transactional executor.
//!
//! Every call borrows one pooled connection for its duration. Writes and
//! schema changes run inside an IMMEDIATE transaction that is rolled back on
//! any failure; the engine error is classified and returned with its
//! diagnosis attached.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};

use crate::capabilities::{self, Capabilities, ResourceDescriptor, ToolDescriptor};
use crate::diagnosis::{ErrorClassifier, truncate_statement};
use crate::error::{ExecutionError, OpenError};
use crate::insights::{INSIGHTS_MEMO_URI, InsightLedger};
use crate::jsonb;
use crate::pool::Pool;
use crate::route::{JsonbColumn, route_jsonb_params};
use crate::schema::{ColumnMigrationState, prepare_binary_column};
use crate::sqlite::{DEFAULT_BUSY_TIMEOUT_MS, SqliteConn, SqliteOpenMode, sqlite_pool};
use crate::statement::{StatementClass, classify_statement, leading_keyword};
use crate::value::{CellValue, ExecutionResult, Params, Row};

pub const DEFAULT_DB_PATH: &str = "database.db";
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

const TRANSACTION_CONTROL: [&str; 6] = ["begin", "commit", "end", "rollback", "savepoint", "release"];

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub db_path: PathBuf,
    pub jsonb_enabled: bool,
    pub pool_size: usize,
    pub busy_timeout: Duration,
    /// Upper bound on waiting for a pooled connection; `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    pub jsonb_columns: Vec<JsonbColumn>,
}

impl ExecutorConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            jsonb_enabled: true,
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            acquire_timeout: Some(Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS)),
            jsonb_columns: vec![JsonbColumn::memory_journal_metadata()],
        }
    }
}

/// Receives a URI whenever the content behind it changes.
pub trait ResourceObserver: Send + Sync {
    fn resource_updated(&self, uri: &str);
}

pub struct Executor {
    pool: Arc<Pool<SqliteConn>>,
    config: ExecutorConfig,
    capabilities: Capabilities,
    classifier: ErrorClassifier,
    migrations: Vec<(JsonbColumn, ColumnMigrationState)>,
    insights: Mutex<InsightLedger>,
    observer: Option<Arc<dyn ResourceObserver>>,
}

impl Executor {
    /// Opens the pool, probes engine capabilities and runs the one-time
    /// storage check (and migration) of every binary-JSON column.
    pub fn open(config: ExecutorConfig) -> Result<Self, OpenError> {
        let pool = sqlite_pool(
            &config.db_path,
            config.pool_size,
            SqliteOpenMode::ReadWrite,
            config.busy_timeout,
        );
        let mut conn = pool
            .acquire(config.acquire_timeout)
            .map_err(|source| OpenError::Database {
                path: config.db_path.display().to_string(),
                source,
            })?;
        let capabilities = Capabilities::probe(conn.as_ref().connection(), config.jsonb_enabled)?;
        tracing::info!(
            path = %config.db_path.display(),
            sqlite_version = %capabilities.sqlite_version,
            jsonb_supported = capabilities.jsonb_supported,
            jsonb_enabled = capabilities.jsonb_enabled,
            fts5 = capabilities.fts5,
            "database opened"
        );
        let migrations = config
            .jsonb_columns
            .iter()
            .map(|column| {
                let state = prepare_binary_column(
                    conn.as_mut().connection_mut(),
                    column,
                    capabilities.jsonb_active(),
                );
                tracing::debug!(table = %column.table, column = %column.column, ?state, "binary JSON column state");
                (column.clone(), state)
            })
            .collect();
        drop(conn);
        let classifier = ErrorClassifier::new(config.jsonb_columns.iter().map(|c| c.column.clone()));
        Ok(Self {
            pool,
            config,
            capabilities,
            classifier,
            migrations,
            insights: Mutex::new(InsightLedger::new()),
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResourceObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.capabilities.tools()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        capabilities::resources()
    }

    pub fn migration_states(&self) -> &[(JsonbColumn, ColumnMigrationState)] {
        &self.migrations
    }

    pub fn pool(&self) -> &Arc<Pool<SqliteConn>> {
        &self.pool
    }

    /// Runs one statement with bound parameters.
    pub fn execute(&self, sql: &str, params: &Params) -> Result<ExecutionResult, ExecutionError> {
        let keyword = leading_keyword(sql);
        if TRANSACTION_CONTROL
            .iter()
            .any(|control| keyword.eq_ignore_ascii_case(control))
        {
            return Err(ExecutionError::InvalidInput(format!(
                "{keyword} is not allowed; each call runs in its own transaction"
            )));
        }
        let class = classify_statement(sql);
        let sql: Cow<'_, str> = if class == StatementClass::Write && self.capabilities.jsonb_active() {
            route_jsonb_params(sql, params, &self.config.jsonb_columns)
        } else {
            Cow::Borrowed(sql)
        };
        if let Cow::Owned(routed) = &sql {
            tracing::debug!(statement = %truncate_statement(routed), "routed binary JSON parameters");
        }
        tracing::debug!(%class, statement = %truncate_statement(&sql), "executing statement");

        let mut conn = self.pool.acquire(self.config.acquire_timeout)?;
        let outcome = run_statement(
            conn.as_mut().connection_mut(),
            &sql,
            params,
            class,
            self.decode_columns(),
        );
        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                if conn.as_ref().in_transaction() {
                    if let Err(rollback) = conn.as_ref().connection().execute_batch("ROLLBACK") {
                        tracing::warn!(error = %rollback, "rollback failed; discarding connection");
                    }
                    if conn.as_ref().in_transaction() {
                        conn.discard();
                    }
                }
                Err(self.engine_error(err, &sql, !params.is_empty()))
            }
        }
    }

    /// Wraps an engine error with its diagnosis.
    pub(crate) fn engine_error(&self, err: rusqlite::Error, sql: &str, has_params: bool) -> ExecutionError {
        let diagnosis = self.classifier.classify(&err, sql, has_params);
        let message = diagnosis.user_message(&err.to_string());
        tracing::warn!(
            category = %diagnosis.category,
            retryable = diagnosis.retryable,
            error = %err,
            "statement failed"
        );
        ExecutionError::Engine {
            message,
            diagnosis: Box::new(diagnosis),
            source: err,
        }
    }

    /// Columns whose blob values are decoded back into JSON on the way out.
    fn decode_columns(&self) -> Option<&[JsonbColumn]> {
        self.capabilities
            .jsonb_active()
            .then_some(self.config.jsonb_columns.as_slice())
    }

    pub fn read(&self, sql: &str, params: &Params) -> Result<Vec<Row>, ExecutionError> {
        expect_class(sql, "read", StatementClass::Read, "SELECT")?;
        self.execute(sql, params).map(ExecutionResult::into_rows)
    }

    /// Runs anything except a plain read.
    pub fn write(&self, sql: &str, params: &Params) -> Result<ExecutionResult, ExecutionError> {
        let class = classify_statement(sql);
        if class == StatementClass::Read {
            return Err(ExecutionError::StatementClassMismatch {
                operation: "write",
                expected: "non-SELECT",
                actual: class,
            });
        }
        self.execute(sql, params)
    }

    pub fn create_schema(&self, sql: &str) -> Result<ExecutionResult, ExecutionError> {
        expect_class(sql, "create_schema", StatementClass::SchemaChange, "CREATE")?;
        if !leading_keyword(sql).eq_ignore_ascii_case("create") {
            return Err(ExecutionError::StatementClassMismatch {
                operation: "create_schema",
                expected: "CREATE",
                actual: StatementClass::SchemaChange,
            });
        }
        self.execute(sql, &Params::None)
    }

    /// Names of user tables, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>, ExecutionError> {
        let rows = self.read(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &Params::None,
        )?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(CellValue::as_str).map(str::to_string))
            .collect())
    }

    /// Column metadata of `table`; the name is bound, never interpolated.
    pub fn describe_table(&self, table: &str) -> Result<Vec<Row>, ExecutionError> {
        let rows = self.read(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
            &Params::Positional(vec![table.into()]),
        )?;
        if rows.is_empty() {
            return Err(ExecutionError::InvalidInput(format!("Table '{table}' does not exist")));
        }
        Ok(rows)
    }

    pub fn append_insight(&self, insight: &str) -> Result<usize, ExecutionError> {
        if insight.trim().is_empty() {
            return Err(ExecutionError::InvalidInput("insight must not be empty".to_string()));
        }
        let count = {
            let mut ledger = self.insights.lock().unwrap();
            ledger.append(insight);
            ledger.len()
        };
        tracing::info!(count, "insight appended");
        if let Some(observer) = &self.observer {
            observer.resource_updated(INSIGHTS_MEMO_URI);
        }
        Ok(count)
    }

    pub fn insights_memo(&self) -> String {
        self.insights.lock().unwrap().render()
    }
}

fn expect_class(
    sql: &str,
    operation: &'static str,
    expected: StatementClass,
    expected_name: &'static str,
) -> Result<(), ExecutionError> {
    let actual = classify_statement(sql);
    if actual == expected {
        return Ok(());
    }
    Err(ExecutionError::StatementClassMismatch {
        operation,
        expected: expected_name,
        actual,
    })
}

fn run_statement(
    conn: &mut Connection,
    sql: &str,
    params: &Params,
    class: StatementClass,
    decode: Option<&[JsonbColumn]>,
) -> rusqlite::Result<ExecutionResult> {
    if !class.needs_transaction() {
        return run_in(conn, sql, params, class, decode);
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = run_in(&tx, sql, params, class, decode)?;
    tx.commit()?;
    Ok(result)
}

fn run_in(
    conn: &Connection,
    sql: &str,
    params: &Params,
    class: StatementClass,
    decode: Option<&[JsonbColumn]>,
) -> rusqlite::Result<ExecutionResult> {
    let mut stmt = conn.prepare(sql)?;
    params.bind(&mut stmt)?;
    if stmt.column_count() == 0 {
        let affected = stmt.raw_execute()?;
        return Ok(ExecutionResult::Affected {
            affected_rows: affected as u64,
        });
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    {
        let mut cursor = stmt.raw_query();
        while let Some(row) = cursor.next()? {
            let mut record = Row::default();
            for (idx, name) in names.iter().enumerate() {
                record.insert(name.clone(), CellValue::from(row.get_ref(idx)?));
            }
            rows.push(record);
        }
    }
    if matches!(class, StatementClass::Write | StatementClass::SchemaChange) {
        // RETURNING clauses still report the change count.
        return Ok(ExecutionResult::Affected {
            affected_rows: conn.changes() as u64,
        });
    }
    if let Some(columns) = decode {
        decode_binary_json(conn, &mut rows, columns);
    }
    Ok(ExecutionResult::Rows(rows))
}

/// Replaces binary-JSON blobs with their parsed value. Values that fail to
/// decode stay as raw blobs.
fn decode_binary_json(conn: &Connection, rows: &mut [Row], columns: &[JsonbColumn]) {
    for row in rows {
        for column in columns {
            let Some(cell) = row.get_mut(&column.column) else {
                continue;
            };
            let CellValue::Blob(bytes) = cell else {
                continue;
            };
            match jsonb::decode_value(conn, bytes) {
                Ok(value) => *cell = CellValue::Json(value),
                Err(err) => {
                    tracing::debug!(column = %column.column, error = %err, "leaving undecodable blob as-is");
                }
            }
        }
    }
}
