use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use sqlgate_db::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_DB_PATH, ExecutorConfig, is_memory_path};

pub const DEFAULT_MAX_QUEUE: usize = 64;
pub const DEFAULT_LOG_DIR: &str = "./logs";

/// SQLite gateway worker speaking length-prefixed frames on stdin/stdout.
#[derive(Parser, Debug, Clone)]
#[command(name = "sqlgate-worker", version, about)]
pub struct WorkerConfig {
    /// SQLite database file (`:memory:` for a private in-memory database)
    #[arg(long, value_name = "FILE", env = "SQLITE_DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: PathBuf,

    /// Store configured JSON columns as binary JSON when the engine supports it
    #[arg(
        long,
        env = "SQLITE_JSONB_ENABLED",
        default_value = "true",
        value_parser = parse_bool,
        action = clap::ArgAction::Set
    )]
    pub jsonb_enabled: bool,

    /// Log at debug level
    #[arg(
        long,
        env = "SQLITE_DEBUG",
        default_value = "false",
        value_parser = parse_bool,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub debug: bool,

    /// Directory for the worker log file
    #[arg(long, value_name = "DIR", env = "SQLITE_LOG_DIR", default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Worker threads (defaults to available parallelism)
    #[arg(long, env = "SQLGATE_THREADS")]
    pub threads: Option<usize>,

    /// Pending requests before new ones are answered Busy
    #[arg(long, env = "SQLGATE_MAX_QUEUE", default_value_t = DEFAULT_MAX_QUEUE)]
    pub max_queue: usize,

    /// Connection pool bound (defaults to the thread count)
    #[arg(long, env = "SQLGATE_DB_POOL")]
    pub pool_size: Option<usize>,

    /// How long SQLite waits on a locked database before reporting busy
    #[arg(long, env = "SQLGATE_BUSY_TIMEOUT_MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    pub busy_timeout_ms: u64,
}

pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected true/false, 1/0, yes/no or on/off, got '{other}'")),
    }
}

impl WorkerConfig {
    pub fn thread_count(&self) -> usize {
        self.threads.filter(|count| *count > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(4)
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::new(&self.db_path);
        config.jsonb_enabled = self.jsonb_enabled;
        config.pool_size = self.pool_size.unwrap_or_else(|| self.thread_count()).max(1);
        config.busy_timeout = Duration::from_millis(self.busy_timeout_ms);
        config
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("sqlgate-worker.log")
    }
}

/// Creates the parent directory of an on-disk database.
pub fn ensure_db_parent(path: &Path) -> std::io::Result<()> {
    if is_memory_path(path) {
        return Ok(());
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_values() {
        for truthy in ["true", "1", "YES", " on "] {
            assert_eq!(parse_bool(truthy), Ok(true), "{truthy}");
        }
        for falsy in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_bool(falsy), Ok(false), "{falsy}");
        }
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn flags_map_onto_executor_config() {
        let config = WorkerConfig::try_parse_from([
            "sqlgate-worker",
            "--db-path",
            "data/app.db",
            "--jsonb-enabled",
            "off",
            "--threads",
            "3",
            "--busy-timeout-ms",
            "250",
        ])
        .expect("parse");
        let executor = config.executor_config();
        assert_eq!(executor.db_path, PathBuf::from("data/app.db"));
        assert!(!executor.jsonb_enabled);
        assert_eq!(executor.pool_size, 3);
        assert_eq!(executor.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.log_file(), PathBuf::from(DEFAULT_LOG_DIR).join("sqlgate-worker.log"));
    }

    #[test]
    fn explicit_pool_size_wins() {
        let config =
            WorkerConfig::try_parse_from(["sqlgate-worker", "--threads", "8", "--pool-size", "2"])
                .expect("parse");
        assert_eq!(config.executor_config().pool_size, 2);
    }

    #[test]
    fn creates_database_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("db.sqlite");
        ensure_db_parent(&path).expect("create parent");
        assert!(dir.path().join("nested").is_dir());
        ensure_db_parent(Path::new(":memory:")).expect("memory");
    }
}
