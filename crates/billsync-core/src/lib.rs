//! # billsync-core
//!
//! Core sync engine for billsync - shared between the CLI and the scheduler.
//!
//! This crate provides:
//! - Database connections and bootstrap (`db` module)
//! - Legacy and destination store abstractions (`store` module)
//! - Data models (`models` module)
//! - The incremental sync pipeline and its jobs (`services` module)
//! - Cron scheduling of jobs (`scheduler` module)
//! - Configuration loading (`config` module)
//! - Unified error handling (`error` module)

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::{get_config_path, JobOverrides, LineItemTransfer, ScheduledTask, SyncConfig};
pub use db::Database;
pub use error::{DecodeError, Error, RecordError, Result};

// Re-export commonly used types from models
pub use models::{
    Caller, FailedRecord, InvoiceKind, JobKind, LineItem, Money, RecordFailure, RunSummary,
    Status, SyncWindow, WithholdingKind,
};

// Re-export commonly used types from services
pub use services::{
    get_job_by_name, get_job_names, BoundedInserter, InsertReport, JobSettings, RecordOutcome,
    SyncEngine,
};

pub use scheduler::SyncScheduler;
pub use store::{DestinationStore, LegacyStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version
pub fn version() -> &'static str {
    VERSION
}
