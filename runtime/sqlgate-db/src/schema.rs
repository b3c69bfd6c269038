//! Storage-class checks and in-place migration for binary-JSON columns.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::route::JsonbColumn;

/// Declared type a binary-JSON column should carry.
pub const BINARY_STORAGE_TYPE: &str = "BLOB";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotApplicable {
    MissingTable,
    MissingColumn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnCheck {
    Optimal,
    Suboptimal { declared_type: String },
    NotApplicable(NotApplicable),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOutcome {
    pub success: bool,
    pub rows_before: u64,
    pub rows_after: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum MigrationError {
    #[error(transparent)]
    Engine(#[from] rusqlite::Error),
    #[error("{count} row(s) in {table}.{column} hold invalid JSON")]
    InvalidValues {
        count: i64,
        table: String,
        column: String,
    },
    #[error("row count changed during migration ({before} before, {after} after)")]
    RowCountChanged { before: u64, after: u64 },
}

/// Storage state of one binary-JSON column, computed once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnMigrationState {
    #[default]
    Unknown,
    Checked(ColumnCheck),
    MigrationAttempted(MigrationOutcome),
}

/// Quotes an identifier for interpolation into DDL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn check_column_type(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<ColumnCheck> {
    let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        return Ok(ColumnCheck::NotApplicable(NotApplicable::MissingTable));
    }
    let Some((_, declared_type)) = columns
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(column))
    else {
        return Ok(ColumnCheck::NotApplicable(NotApplicable::MissingColumn));
    };
    if declared_type.trim().eq_ignore_ascii_case(BINARY_STORAGE_TYPE) {
        Ok(ColumnCheck::Optimal)
    } else {
        Ok(ColumnCheck::Suboptimal { declared_type })
    }
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
        .map(|count| count as u64)
}

/// Converts `table.column` to binary JSON storage in one transaction: add a
/// BLOB column, copy every value through `jsonb()`, drop the old column and
/// rename the new one into place. Any failure leaves the table untouched.
pub fn migrate_column(conn: &mut Connection, table: &str, column: &str) -> MigrationOutcome {
    let mut outcome = MigrationOutcome {
        success: false,
        rows_before: 0,
        rows_after: 0,
        error: None,
    };
    match run_migration(conn, table, column, &mut outcome) {
        Ok(()) => {
            outcome.success = true;
            tracing::info!(
                table,
                column,
                rows = outcome.rows_after,
                "migrated column to binary JSON storage"
            );
        }
        Err(err) => {
            tracing::error!(table, column, error = %err, "column migration rolled back");
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

fn run_migration(
    conn: &mut Connection,
    table: &str,
    column: &str,
    outcome: &mut MigrationOutcome,
) -> Result<(), MigrationError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let quoted_table = quote_ident(table);
    let quoted_column = quote_ident(column);
    let quoted_staging = quote_ident(&format!("{column}_jsonb"));

    outcome.rows_before = count_rows(&tx, table)?;
    let invalid: i64 = tx.query_row(
        &format!(
            "SELECT COUNT(*) FROM {quoted_table} \
             WHERE {quoted_column} IS NOT NULL AND json_valid({quoted_column}, 6) = 0"
        ),
        [],
        |row| row.get(0),
    )?;
    if invalid > 0 {
        return Err(MigrationError::InvalidValues {
            count: invalid,
            table: table.to_string(),
            column: column.to_string(),
        });
    }

    tx.execute_batch(&format!(
        "ALTER TABLE {quoted_table} ADD COLUMN {quoted_staging} {BINARY_STORAGE_TYPE};
         UPDATE {quoted_table} SET {quoted_staging} = jsonb({quoted_column}) WHERE {quoted_column} IS NOT NULL;
         ALTER TABLE {quoted_table} DROP COLUMN {quoted_column};
         ALTER TABLE {quoted_table} RENAME COLUMN {quoted_staging} TO {quoted_column};"
    ))?;

    outcome.rows_after = count_rows(&tx, table)?;
    if outcome.rows_after != outcome.rows_before {
        return Err(MigrationError::RowCountChanged {
            before: outcome.rows_before,
            after: outcome.rows_after,
        });
    }
    tx.commit()?;
    Ok(())
}

fn trigger_name(table: &str, column: &str) -> String {
    format!("validate_{table}_{column}")
}

/// Installs a BEFORE INSERT trigger rejecting values that are neither JSON
/// text nor binary JSON. Returns `false` when the trigger already existed.
pub fn install_validation_trigger(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let name = trigger_name(table, column);
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
            [&name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        return Ok(false);
    }
    let quoted_column = quote_ident(column);
    let message = format!("Invalid JSON in {table}.{column}").replace('\'', "''");
    conn.execute_batch(&format!(
        "CREATE TRIGGER IF NOT EXISTS {trigger}
         BEFORE INSERT ON {table_ident}
         WHEN NEW.{quoted_column} IS NOT NULL
         BEGIN
             SELECT CASE
                 WHEN json_valid(NEW.{quoted_column}, 6) = 0
                 THEN RAISE(ABORT, '{message}')
             END;
         END;",
        trigger = quote_ident(&name),
        table_ident = quote_ident(table),
    ))?;
    Ok(true)
}

/// Startup pass for one binary-JSON column: check its storage class, migrate
/// it when binary JSON is active, then guard inserts with the validation
/// trigger. Failures are logged and reported in the returned state.
pub fn prepare_binary_column(
    conn: &mut Connection,
    target: &JsonbColumn,
    jsonb_active: bool,
) -> ColumnMigrationState {
    let check = match check_column_type(conn, &target.table, &target.column) {
        Ok(check) => check,
        Err(err) => {
            tracing::warn!(
                table = %target.table,
                column = %target.column,
                error = %err,
                "column type check failed"
            );
            return ColumnMigrationState::Unknown;
        }
    };
    let state = match check {
        ColumnCheck::Suboptimal { declared_type } if jsonb_active => {
            tracing::info!(
                table = %target.table,
                column = %target.column,
                declared_type = %declared_type,
                "column is not stored as binary JSON; migrating"
            );
            ColumnMigrationState::MigrationAttempted(migrate_column(
                conn,
                &target.table,
                &target.column,
            ))
        }
        other => ColumnMigrationState::Checked(other),
    };
    let is_binary = match &state {
        ColumnMigrationState::Checked(ColumnCheck::Optimal) => true,
        ColumnMigrationState::MigrationAttempted(outcome) => outcome.success,
        _ => false,
    };
    if jsonb_active && is_binary {
        match install_validation_trigger(conn, &target.table, &target.column) {
            Ok(true) => tracing::info!(
                table = %target.table,
                column = %target.column,
                "installed JSON validation trigger"
            ),
            Ok(false) => {}
            Err(err) => tracing::warn!(
                table = %target.table,
                column = %target.column,
                error = %err,
                "failed to install JSON validation trigger"
            ),
        }
    }
    state
}
