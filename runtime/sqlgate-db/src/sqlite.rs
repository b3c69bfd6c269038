//! SQLite connector helpers for the gateway.

use crate::Pool;
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 100;

pub const MEMORY_PATH: &str = ":memory:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqliteOpenMode {
    ReadOnly,
    ReadWrite,
}

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    pub fn open(
        path: &Path,
        mode: SqliteOpenMode,
        busy_timeout: Duration,
    ) -> Result<Self, rusqlite::Error> {
        let flags = match mode {
            SqliteOpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            SqliteOpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if matches!(mode, SqliteOpenMode::ReadOnly) {
            conn.execute_batch("PRAGMA query_only = 1;")?;
        }
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// True while an explicit transaction is still open on this connection.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

pub fn is_memory_path(path: &Path) -> bool {
    path.as_os_str() == MEMORY_PATH
}

/// Builds a pool of connections to `path`. An in-memory database only exists
/// per connection, so its pool is capped at one.
pub fn sqlite_pool(
    path: &Path,
    pool_size: usize,
    mode: SqliteOpenMode,
    busy_timeout: Duration,
) -> Arc<Pool<SqliteConn>> {
    let size = if is_memory_path(path) { 1 } else { pool_size };
    let path: PathBuf = path.to_path_buf();
    Pool::new(size, move || SqliteConn::open(&path, mode, busy_timeout))
}
