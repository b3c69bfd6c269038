use thiserror::Error;

use crate::diagnosis::Diagnosis;
use crate::pool::AcquireError;
use crate::statement::StatementClass;

/// Failure of a single execution call. Engine failures always carry the
/// classifier's diagnosis alongside the original error.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{message}")]
    Engine {
        message: String,
        diagnosis: Box<Diagnosis>,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{operation} accepts {expected} statements, got a {actual} statement")]
    StatementClassMismatch {
        operation: &'static str,
        expected: &'static str,
        actual: StatementClass,
    },
    #[error("connection unavailable: {0}")]
    Connection(#[from] AcquireError),
    #[error("{0}")]
    InvalidInput(String),
}

impl ExecutionError {
    /// Wire status reported for this failure.
    pub fn status(&self) -> &'static str {
        match self {
            ExecutionError::Engine { diagnosis, .. } if diagnosis.retryable => "Busy",
            ExecutionError::Engine { .. } => "DatabaseError",
            ExecutionError::StatementClassMismatch { .. } | ExecutionError::InvalidInput(_) => {
                "InvalidInput"
            }
            ExecutionError::Connection(AcquireError::Timeout) => "Busy",
            ExecutionError::Connection(AcquireError::Create(_)) => "InternalError",
        }
    }

    pub fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            ExecutionError::Engine { diagnosis, .. } => Some(diagnosis),
            _ => None,
        }
    }
}

/// Failure to bring up an executor.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("failed to open database {path}: {source}")]
    Database {
        path: String,
        #[source]
        source: AcquireError,
    },
    #[error("failed to probe engine capabilities: {0}")]
    Probe(#[from] rusqlite::Error),
}
