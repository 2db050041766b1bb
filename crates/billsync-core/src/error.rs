//! Unified error handling for billsync-core
//!
//! Two layers of failure exist in a sync run:
//! - [`Error`] aborts the whole run and is returned to the caller.
//! - [`RecordError`] belongs to a single legacy record; it is collected into
//!   the run report and never fails the run.

use std::time::Duration;

use thiserror::Error;

/// Core error type for billsync-core (fatal for a run)
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for billsync-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for Error {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        Error::Scheduler(format!("{:?}", err))
    }
}

/// A malformed legacy line-item aggregation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("line item entry {index} has {found} fields, expected {expected}: {entry:?}")]
    FieldCount {
        index: usize,
        found: usize,
        expected: usize,
        entry: String,
    },

    #[error("line item blob for parent {parent} is malformed: {source}")]
    Parent {
        parent: String,
        #[source]
        source: Box<DecodeError>,
    },
}

/// Per-record failure; the record stays unmigrated and is retried when it
/// is extracted again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("no destination mapping for {what} (legacy key {key:?})")]
    Unresolved { what: &'static str, key: String },

    #[error("cannot parse {field} from {value:?}")]
    Parse { field: &'static str, value: String },

    #[error("reconciliation failed: {0}")]
    Reconcile(String),

    #[error("destination call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store error: {0}")]
    Store(String),
}

impl RecordError {
    /// Create an unresolved-mapping error
    pub fn unresolved(what: &'static str, key: impl Into<String>) -> Self {
        RecordError::Unresolved {
            what,
            key: key.into(),
        }
    }

    /// Create a numeric/field parse error
    pub fn parse(field: &'static str, value: impl Into<String>) -> Self {
        RecordError::Parse {
            field,
            value: value.into(),
        }
    }
}

impl From<Error> for RecordError {
    fn from(err: Error) -> Self {
        RecordError::Store(err.to_string())
    }
}

impl From<sqlx::Error> for RecordError {
    fn from(err: sqlx::Error) -> Self {
        RecordError::Store(err.to_string())
    }
}
