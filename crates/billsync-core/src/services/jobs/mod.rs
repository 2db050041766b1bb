//! Sync Jobs
//!
//! One [`SyncJob`](super::orchestrator::SyncJob) per legacy entity type.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ SyncEngine::run(kind, caller)                       │
//! │   run_job(job, ctx) under the run timeout           │
//! └─────────────────────────────────────────────────────┘
//!          │
//!          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ trait SyncJob                                       │
//! │   fn extract(window) -> Vec<Record>                 │
//! │   fn process(record) -> RecordOutcome               │
//! └─────────────────────────────────────────────────────┘
//!          │
//!    ┌─────┼──────────┬─────────────┬───────────┐
//!    ▼     ▼          ▼             ▼           ▼
//! ┌──────┐┌────────┐┌───────────┐┌───────────┐┌─────────┐
//! │ rate ││ fiscal ││pre-invoice││withholding││ receipt │
//! └──────┘└────────┘└───────────┘└───────────┘└─────────┘
//! ```
//!
//! Every `process` follows the same order: resolve references (idempotency
//! and parent checks first), then decode line items, reconcile amounts, and
//! write through the destination store under the job's write timeout.

pub mod exchange_rate;
pub mod fiscal_invoice;
pub mod pre_invoice;
pub mod receipt;
pub mod withholding;

pub use exchange_rate::ExchangeRateJob;
pub use fiscal_invoice::FiscalInvoiceJob;
pub use pre_invoice::PreInvoiceJob;
pub use receipt::ReceiptJob;
pub use withholding::WithholdingJob;

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};

use super::inserter::timed;
use super::resolver::{self, Resolution};
use super::registry::JobSettings;
use crate::error::{RecordError, Result};
use crate::models::{CustomerSnapshot, SyncWindow};
use crate::store::{DestinationStore, Extract, LegacyStore, RefRequest};

/// Metadata origin marker of every record created by the sync
pub const ORIGIN: &str = "from_scratch";

/// Stores and settings shared by the jobs of one run
#[derive(Clone)]
pub struct JobContext {
    pub legacy: Arc<dyn LegacyStore>,
    pub destination: Arc<dyn DestinationStore>,
    pub settings: JobSettings,
}

impl JobContext {
    pub fn extract<'a>(&self, window: &'a SyncWindow) -> Extract<'a> {
        Extract {
            window,
            row_cap: self.settings.row_cap,
            transfer: self.settings.line_item_transfer,
        }
    }

    pub async fn resolve(&self, request: &RefRequest) -> std::result::Result<Resolution, RecordError> {
        resolver::resolve(
            self.destination.as_ref(),
            request,
            self.settings.write_timeout,
        )
        .await
    }

    /// Await a destination call under the write timeout
    pub async fn write<T, F>(&self, call: F) -> std::result::Result<T, RecordError>
    where
        F: Future<Output = Result<T>>,
    {
        timed(self.settings.write_timeout, call).await
    }
}

/// `cliente_info` block of invoice metadata
pub(crate) fn customer_info(customer: &CustomerSnapshot) -> Value {
    json!({
        "razon_social": customer.razon_social.clone().unwrap_or_default(),
        "docid": customer.docid.clone().unwrap_or_default(),
        "telefono": customer.telefono.clone().unwrap_or_default(),
        "direccion": customer.direccion.clone().unwrap_or_default(),
    })
}
