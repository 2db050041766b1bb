//! Services module

pub mod decoder;
pub mod inserter;
pub mod jobs;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod watermark;

pub use decoder::{decode, parse_concatenated, sanitize_description, Pricing};
pub use inserter::{timed, BoundedInserter, InsertReport, RecordOutcome};
pub use jobs::{
    ExchangeRateJob, FiscalInvoiceJob, JobContext, PreInvoiceJob, ReceiptJob, WithholdingJob,
};
pub use orchestrator::{run_job, SyncJob};
pub use registry::{get_job_by_name, get_job_names, JobSettings, SyncEngine};
pub use resolver::{Refs, Resolution};
pub use watermark::resolve_window;
